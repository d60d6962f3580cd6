//! bounds-checked packet buffers used by the wire codec
//!
//! Every parse works on a call-local buffer; nothing here is shared between
//! threads. `BytePacketBuffer` is the fixed-size receive buffer (its size is
//! the documented maximum response we will parse), `VectorPacketBuffer` is
//! the growable buffer used when building outgoing messages and when parsing
//! TCP replies of known length.

use derive_more::{Display, Error};

#[derive(Debug, Display, Error)]
pub enum BufferError {
    EndOfBuffer,
    LabelTooLong,
}

type Result<T> = std::result::Result<T, BufferError>;

/// Largest response we are prepared to parse. UDP answers fit in far less;
/// the TCP TKEY reply is the only large message on this path.
pub const MAX_PACKET_SIZE: usize = 4096;

/// Cursor-style access to a DNS message.
///
/// Domain names use the usual label encoding: each label is a length byte
/// followed by that many bytes, the name ends with a zero length byte. A
/// length byte with the two high bits set is a compression pointer into the
/// packet. `read_qname` follows at most one pointer: after the jump, a second
/// pointer terminates the name instead of being chased. The responders this
/// code talks to never nest pointers deeper than one level.
pub trait PacketBuffer {
    fn read(&mut self) -> Result<u8>;
    fn get(&self, pos: usize) -> Result<u8>;
    fn get_range(&self, start: usize, len: usize) -> Result<&[u8]>;
    fn write(&mut self, val: u8) -> Result<()>;
    fn set(&mut self, pos: usize, val: u8) -> Result<()>;
    fn pos(&self) -> usize;
    fn seek(&mut self, pos: usize) -> Result<()>;
    fn step(&mut self, steps: usize) -> Result<()>;

    fn read_u16(&mut self) -> Result<u16> {
        let res = ((self.read()? as u16) << 8) | (self.read()? as u16);
        Ok(res)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let res = ((self.read()? as u32) << 24)
            | ((self.read()? as u32) << 16)
            | ((self.read()? as u32) << 8)
            | (self.read()? as u32);
        Ok(res)
    }

    fn write_u8(&mut self, val: u8) -> Result<()> {
        self.write(val)
    }

    fn write_u16(&mut self, val: u16) -> Result<()> {
        self.write((val >> 8) as u8)?;
        self.write((val & 0xFF) as u8)?;
        Ok(())
    }

    fn write_u32(&mut self, val: u32) -> Result<()> {
        self.write(((val >> 24) & 0xFF) as u8)?;
        self.write(((val >> 16) & 0xFF) as u8)?;
        self.write(((val >> 8) & 0xFF) as u8)?;
        self.write((val & 0xFF) as u8)?;
        Ok(())
    }

    fn set_u16(&mut self, pos: usize, val: u16) -> Result<()> {
        self.set(pos, (val >> 8) as u8)?;
        self.set(pos + 1, (val & 0xFF) as u8)?;
        Ok(())
    }

    /// Write `qname` as a sequence of length-prefixed labels followed by a
    /// zero byte. No compression is emitted; queries are small.
    fn write_qname(&mut self, qname: &str) -> Result<()> {
        for label in qname.split('.').filter(|l| !l.is_empty()) {
            let len = label.len();
            if len > 0x3F {
                return Err(BufferError::LabelTooLong);
            }
            self.write(len as u8)?;
            for b in label.as_bytes() {
                self.write(*b)?;
            }
        }
        self.write(0)?;
        Ok(())
    }

    /// Read a domain name at the cursor into `outstr`, leaving the cursor
    /// just past the name (past the pointer if one was followed).
    fn read_qname(&mut self, outstr: &mut String) -> Result<()> {
        let mut pos = self.pos();
        let mut jumped = false;
        let mut delim = "";

        loop {
            let len = self.get(pos)?;

            if (len & 0xC0) == 0xC0 {
                if jumped {
                    // single-hop rule: a second pointer ends the name
                    break;
                }

                // cursor resumes after the two pointer bytes
                self.seek(pos + 2)?;

                let b2 = self.get(pos + 1)? as u16;
                let offset = (((len as u16) ^ 0xC0) << 8) | b2;
                pos = offset as usize;
                jumped = true;
                continue;
            }

            pos += 1;

            if len == 0 {
                break;
            }

            outstr.push_str(delim);
            outstr.push_str(&String::from_utf8_lossy(
                self.get_range(pos, len as usize)?,
            ));
            delim = ".";

            pos += len as usize;
        }

        if !jumped {
            self.seek(pos)?;
        }

        Ok(())
    }

    /// Advance past a domain name without materializing it, used when a
    /// record's owner name is irrelevant but the cursor must stay in sync.
    fn skip_qname(&mut self) -> Result<()> {
        loop {
            let len = self.read()?;
            if (len & 0xC0) == 0xC0 {
                self.step(1)?;
                return Ok(());
            }
            if len == 0 {
                return Ok(());
            }
            self.step(len as usize)?;
        }
    }
}

/// Fixed-size buffer for receiving datagrams and holding whole messages.
pub struct BytePacketBuffer {
    pub buf: [u8; MAX_PACKET_SIZE],
    pub pos: usize,
}

impl BytePacketBuffer {
    pub fn new() -> BytePacketBuffer {
        BytePacketBuffer {
            buf: [0; MAX_PACKET_SIZE],
            pos: 0,
        }
    }
}

impl Default for BytePacketBuffer {
    fn default() -> Self {
        BytePacketBuffer::new()
    }
}

impl PacketBuffer for BytePacketBuffer {
    fn read(&mut self) -> Result<u8> {
        if self.pos >= MAX_PACKET_SIZE {
            return Err(BufferError::EndOfBuffer);
        }
        let res = self.buf[self.pos];
        self.pos += 1;
        Ok(res)
    }

    fn get(&self, pos: usize) -> Result<u8> {
        if pos >= MAX_PACKET_SIZE {
            return Err(BufferError::EndOfBuffer);
        }
        Ok(self.buf[pos])
    }

    fn get_range(&self, start: usize, len: usize) -> Result<&[u8]> {
        if start + len > MAX_PACKET_SIZE {
            return Err(BufferError::EndOfBuffer);
        }
        Ok(&self.buf[start..start + len])
    }

    fn write(&mut self, val: u8) -> Result<()> {
        if self.pos >= MAX_PACKET_SIZE {
            return Err(BufferError::EndOfBuffer);
        }
        self.buf[self.pos] = val;
        self.pos += 1;
        Ok(())
    }

    fn set(&mut self, pos: usize, val: u8) -> Result<()> {
        if pos >= MAX_PACKET_SIZE {
            return Err(BufferError::EndOfBuffer);
        }
        self.buf[pos] = val;
        Ok(())
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > MAX_PACKET_SIZE {
            return Err(BufferError::EndOfBuffer);
        }
        self.pos = pos;
        Ok(())
    }

    fn step(&mut self, steps: usize) -> Result<()> {
        if self.pos + steps > MAX_PACKET_SIZE {
            return Err(BufferError::EndOfBuffer);
        }
        self.pos += steps;
        Ok(())
    }
}

/// Growable buffer for building outgoing messages and for parsing TCP
/// replies whose length is known up front.
pub struct VectorPacketBuffer {
    pub buffer: Vec<u8>,
    pub pos: usize,
}

impl VectorPacketBuffer {
    pub fn new() -> VectorPacketBuffer {
        VectorPacketBuffer {
            buffer: Vec::new(),
            pos: 0,
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> VectorPacketBuffer {
        VectorPacketBuffer {
            buffer: bytes,
            pos: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Default for VectorPacketBuffer {
    fn default() -> Self {
        VectorPacketBuffer::new()
    }
}

impl PacketBuffer for VectorPacketBuffer {
    fn read(&mut self) -> Result<u8> {
        if self.pos >= self.buffer.len() {
            return Err(BufferError::EndOfBuffer);
        }
        let res = self.buffer[self.pos];
        self.pos += 1;
        Ok(res)
    }

    fn get(&self, pos: usize) -> Result<u8> {
        if pos >= self.buffer.len() {
            return Err(BufferError::EndOfBuffer);
        }
        Ok(self.buffer[pos])
    }

    fn get_range(&self, start: usize, len: usize) -> Result<&[u8]> {
        if start + len > self.buffer.len() {
            return Err(BufferError::EndOfBuffer);
        }
        Ok(&self.buffer[start..start + len])
    }

    fn write(&mut self, val: u8) -> Result<()> {
        if self.pos == self.buffer.len() {
            self.buffer.push(val);
        } else if self.pos < self.buffer.len() {
            self.buffer[self.pos] = val;
        } else {
            return Err(BufferError::EndOfBuffer);
        }
        self.pos += 1;
        Ok(())
    }

    fn set(&mut self, pos: usize, val: u8) -> Result<()> {
        if pos >= self.buffer.len() {
            return Err(BufferError::EndOfBuffer);
        }
        self.buffer[pos] = val;
        Ok(())
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.buffer.len() {
            return Err(BufferError::EndOfBuffer);
        }
        self.pos = pos;
        Ok(())
    }

    fn step(&mut self, steps: usize) -> Result<()> {
        if self.pos + steps > self.buffer.len() {
            return Err(BufferError::EndOfBuffer);
        }
        self.pos += steps;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qname_roundtrip() {
        let mut buffer = VectorPacketBuffer::new();
        buffer.write_qname("host.example.com").unwrap();

        buffer.seek(0).unwrap();
        let mut name = String::new();
        buffer.read_qname(&mut name).unwrap();

        assert_eq!("host.example.com", name);
    }

    #[test]
    fn test_root_name() {
        let mut buffer = VectorPacketBuffer::new();
        buffer.write_qname("").unwrap();
        assert_eq!(1, buffer.len());

        buffer.seek(0).unwrap();
        let mut name = String::new();
        buffer.read_qname(&mut name).unwrap();
        assert_eq!("", name);
    }

    #[test]
    fn test_oversized_label_rejected() {
        let long = "a".repeat(64);
        let mut buffer = VectorPacketBuffer::new();
        assert!(buffer.write_qname(&long).is_err());
    }

    #[test]
    fn test_compression_pointer_single_hop() {
        // "example.com" at offset 0, then a record name "www" + pointer to 0
        let mut buffer = VectorPacketBuffer::new();
        buffer.write_qname("example.com").unwrap();
        let tail = buffer.pos();
        buffer.write_u8(3).unwrap();
        buffer.write_u8(b'w').unwrap();
        buffer.write_u8(b'w').unwrap();
        buffer.write_u8(b'w').unwrap();
        buffer.write_u16(0xC000).unwrap();

        buffer.seek(tail).unwrap();
        let mut name = String::new();
        buffer.read_qname(&mut name).unwrap();

        assert_eq!("www.example.com", name);
        // cursor lands after the pointer bytes, not after the target
        assert_eq!(buffer.pos(), tail + 6);
    }

    #[test]
    fn test_second_pointer_terminates_name() {
        // target name itself ends in a pointer; the second hop is not taken
        let mut buffer = VectorPacketBuffer::new();
        buffer.write_u8(3).unwrap();
        for b in b"dc1" {
            buffer.write_u8(*b).unwrap();
        }
        buffer.write_u16(0xC020).unwrap(); // nested pointer, ignored
        let tail = buffer.pos();
        buffer.write_u16(0xC000).unwrap();

        buffer.seek(tail).unwrap();
        let mut name = String::new();
        buffer.read_qname(&mut name).unwrap();

        assert_eq!("dc1", name);
    }

    #[test]
    fn test_skip_qname_preserves_cursor_math() {
        let mut buffer = VectorPacketBuffer::new();
        buffer.write_qname("skip.me.example.com").unwrap();
        buffer.write_u16(0xBEEF).unwrap();

        buffer.seek(0).unwrap();
        buffer.skip_qname().unwrap();
        assert_eq!(0xBEEF, buffer.read_u16().unwrap());
    }
}
