//! PDU buffers
//!
//! A [`Pdu`] is one serialized 9P message: a fixed-capacity byte buffer plus
//! the message header fields and a write position. Encoding never grows the
//! buffer; running out of room is [`Error::Truncated`], because a message
//! larger than the negotiated `msize` must never reach the wire.

use alloc::vec;
use alloc::vec::Vec;

use crate::error::Error;

/// Bytes of PDU header: size[4] id[1] tag[2]
pub(crate) const HDRSZ: usize = 7;

/// A 9P protocol data unit under construction or received from the wire.
pub(crate) struct Pdu {
    buf: Vec<u8>,
    /// Bytes of `buf` that are valid message data
    size: usize,
    /// Message type, filled by [`Pdu::prepare`] / [`Pdu::parse_header`]
    pub(crate) id: u8,
    /// Transaction tag, filled by [`Pdu::prepare`] / [`Pdu::parse_header`]
    pub(crate) tag: u16,
}

impl Pdu {
    /// Allocate a PDU with room for `capacity` bytes.
    pub(crate) fn with_capacity(capacity: usize) -> Pdu {
        Pdu {
            buf: vec![0; capacity],
            size: 0,
            id: 0,
            tag: 0,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    /// The valid message bytes.
    pub(crate) fn bytes(&self) -> &[u8] {
        &self.buf[..self.size]
    }

    /// The whole buffer, for transports that let the device fill it in.
    pub(crate) fn raw_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Mark `size` bytes of the buffer as valid received data.
    ///
    /// Used by the transport after the device reports how much it wrote.
    pub(crate) fn set_size(&mut self, size: usize) {
        self.size = size.min(self.buf.len());
    }

    /// Forget current contents; keep the allocation.
    pub(crate) fn reset(&mut self) {
        self.size = 0;
        self.id = 0;
        self.tag = 0;
    }

    /// Grow the backing buffer if it is smaller than `capacity`.
    ///
    /// Buffers are reused across tag reuse; a later caller asking for a
    /// larger maximum gets a fresh allocation, a smaller one keeps the old.
    pub(crate) fn ensure_capacity(&mut self, capacity: usize) {
        if self.buf.len() < capacity {
            self.buf = vec![0; capacity];
        }
    }

    pub(crate) fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.buf.len() - self.size < data.len() {
            return Err(Error::Truncated);
        }
        self.buf[self.size..self.size + data.len()].copy_from_slice(data);
        self.size += data.len();
        Ok(())
    }

    pub(crate) fn write_u8(&mut self, v: u8) -> Result<(), Error> {
        self.write(&[v])
    }

    pub(crate) fn write_u16(&mut self, v: u16) -> Result<(), Error> {
        self.write(&v.to_le_bytes())
    }

    pub(crate) fn write_u32(&mut self, v: u32) -> Result<(), Error> {
        self.write(&v.to_le_bytes())
    }

    pub(crate) fn write_u64(&mut self, v: u64) -> Result<(), Error> {
        self.write(&v.to_le_bytes())
    }

    /// Begin a message: a zero placeholder for `size`, then `id` and `tag`.
    /// [`Pdu::finalize`] patches the placeholder once the body is in place.
    pub(crate) fn prepare(&mut self, id: u8, tag: u16) -> Result<(), Error> {
        self.reset();
        self.id = id;
        self.tag = tag;
        self.write_u32(0)?;
        self.write_u8(id)?;
        self.write_u16(tag)
    }

    /// Patch the leading `size` field to the final message length.
    pub(crate) fn finalize(&mut self) {
        let size = self.size as u32;
        self.buf[0..4].copy_from_slice(&size.to_le_bytes());
    }

    /// Parse the 7-byte header of a received message.
    ///
    /// Returns the size the peer claims; the caller is responsible for
    /// treating a claim beyond the received byte count as a protocol fault.
    pub(crate) fn parse_header(&mut self) -> Result<(u32, u8, u16), Error> {
        let hdr = self.bytes();
        if hdr.len() < HDRSZ {
            return Err(Error::Truncated);
        }
        let size = u32::from_le_bytes(hdr[0..4].try_into().unwrap());
        let id = hdr[4];
        let tag = u16::from_le_bytes(hdr[5..7].try_into().unwrap());
        if (size as usize) < HDRSZ || size as usize > self.size {
            return Err(Error::Truncated);
        }
        self.size = size as usize;
        self.id = id;
        self.tag = tag;
        Ok((size, id, tag))
    }
}
