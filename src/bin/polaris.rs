use std::env;
use std::net::IpAddr;
use std::sync::Arc;

use getopts::Options;

use polaris::resolver::context::{ResolverConfig, ResolverContext};
use polaris::resolver::security::{AnonymousCredentials, DisabledSecurityProvider};

fn print_usage(program: &str, opts: Options) {
    let brief = format!("Usage: {} [options] [NAME]", program);
    print!("{}", opts.usage(&brief));
}

/// Command line front end for the Polaris resolver
fn main() {
    simple_logger::init().expect("Failed to initialize logger");

    let args: Vec<String> = env::args().collect();
    let program = args[0].clone();

    let mut opts = Options::new();
    opts.optflag("h", "help", "print this help menu");
    opts.optmulti(
        "n",
        "nameserver",
        "DNS server to query (may be given more than once)",
        "SERVERIP",
    );
    opts.optopt(
        "d",
        "domain",
        "Domain suffix appended to unqualified names",
        "SUFFIX",
    );
    opts.optopt(
        "r",
        "reverse",
        "Reverse-resolve an address instead of a name",
        "ADDRESS",
    );
    opts.optflag(
        "c",
        "controllers",
        "Locate domain controllers for the domain suffix",
    );

    let opt_matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(f) => panic!("{}", f.to_string()),
    };

    if opt_matches.opt_present("h") {
        print_usage(&program, opts);
        return;
    }

    let mut config = ResolverConfig::default();

    for server in opt_matches.opt_strs("n") {
        match server.parse::<IpAddr>() {
            Ok(addr) => config.dns_servers.push(addr),
            Err(_) => {
                log::warn!("{} is not a valid server address - skipping", server);
            }
        }
    }

    if let Some(suffix) = opt_matches.opt_str("d") {
        config.domain_suffix = suffix;
    }

    let context = match ResolverContext::new(
        config,
        Arc::new(AnonymousCredentials),
        Arc::new(DisabledSecurityProvider),
    ) {
        Ok(context) => context,
        Err(e) => {
            log::error!("Failed to initialize resolver: {}", e);
            std::process::exit(1);
        }
    };

    if opt_matches.opt_present("c") {
        match context.locate_domain_controllers("") {
            Ok(controllers) => {
                for controller in controllers {
                    println!("{}", controller);
                }
            }
            Err(e) => {
                log::error!("Controller discovery failed: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    if let Some(reverse) = opt_matches.opt_str("r") {
        let addr = match reverse.parse::<IpAddr>() {
            Ok(addr) => addr,
            Err(_) => {
                log::error!("{} is not a valid address", reverse);
                std::process::exit(1);
            }
        };

        match context.resolve_address(addr) {
            Ok(name) => println!("{}", name),
            Err(e) => {
                log::error!("Reverse lookup failed: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    let name = match opt_matches.free.first() {
        Some(name) => name.clone(),
        None => {
            print_usage(&program, opts);
            std::process::exit(1);
        }
    };

    match context.resolve_host(&name) {
        Ok(addrs) => {
            for addr in addrs {
                println!("{}", addr);
            }
        }
        Err(e) => {
            log::error!("Lookup failed: {}", e);
            std::process::exit(1);
        }
    }
}
