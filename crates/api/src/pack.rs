//! Little-endian binary packing for ElGA wire messages.
//!
//! All integers are little-endian with no padding. `Packer` writes into a
//! growable buffer; `Unpacker` is a bounds-checked cursor over a received
//! frame. Out-of-bounds reads are protocol errors, caught at the message
//! boundary.

use crate::{Dir, Edge, ElgaError, ElgaResult, MsgKind, Update, VagentId, Vertex};
use bytes::{BufMut, Bytes, BytesMut};

/// Wire size of an [Update]: two vertices plus direction and insert words.
pub const UPDATE_WIRE_SIZE: usize = 8 + 8 + 4 + 4;

/// Mask for the endpoint-serial part of a packed virtual agent id.
pub const VAGENT_SERIAL_MASK: u64 = (1u64 << 49) - 1;

/// Pack an endpoint serial and a virtual agent index into a single u64.
/// The low 49 bits carry the serial, the high 15 bits the index.
pub fn pack_vagent(serial: u64, vagent: VagentId) -> u64 {
    serial | (vagent as u64) << 49
}

/// Split a packed virtual agent id into endpoint serial and index.
pub fn unpack_vagent(packed: u64) -> (u64, VagentId) {
    (packed & VAGENT_SERIAL_MASK, (packed >> 49) as VagentId)
}

/// A type with a fixed wire encoding, used for algorithm-owned payloads
/// (vertex notifications and replica contributions).
pub trait WireFixed: Sized {
    /// The exact encoded size in bytes.
    const WIRE_SIZE: usize;

    /// Append the encoding to a packer.
    fn pack(&self, p: &mut Packer);

    /// Decode from an unpacker.
    fn unpack(u: &mut Unpacker<'_>) -> ElgaResult<Self>;
}

/// A growable little-endian message writer.
#[derive(Debug, Default)]
pub struct Packer {
    buf: BytesMut,
}

impl Packer {
    /// Create an empty packer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a packer with a capacity hint.
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(cap),
        }
    }

    /// Create a packer pre-loaded with a message kind byte.
    pub fn msg(kind: MsgKind) -> Self {
        let mut p = Self::new();
        p.kind(kind);
        p
    }

    /// Append a message kind byte.
    pub fn kind(&mut self, kind: MsgKind) -> &mut Self {
        self.buf.put_u8(kind as u8);
        self
    }

    /// Append a u8.
    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    /// Append a little-endian u32.
    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32_le(v);
        self
    }

    /// Append a little-endian i32.
    pub fn i32(&mut self, v: i32) -> &mut Self {
        self.buf.put_i32_le(v);
        self
    }

    /// Append a little-endian u64.
    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.put_u64_le(v);
        self
    }

    /// Append a little-endian i64.
    pub fn i64(&mut self, v: i64) -> &mut Self {
        self.buf.put_i64_le(v);
        self
    }

    /// Append a little-endian f64.
    pub fn f64(&mut self, v: f64) -> &mut Self {
        self.buf.put_f64_le(v);
        self
    }

    /// Append raw bytes.
    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.put_slice(v);
        self
    }

    /// Append an update.
    pub fn update(&mut self, u: &Update) -> &mut Self {
        self.u64(u.edge.src)
            .u64(u.edge.dst)
            .u32(u.dir as u32)
            .u32(u.insert as u32)
    }

    /// Current encoded length.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finish and return the encoded frame.
    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

/// A bounds-checked little-endian cursor over a received frame.
#[derive(Debug)]
pub struct Unpacker<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Unpacker<'a> {
    /// Wrap a frame body.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> ElgaResult<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(ElgaError::protocol(format!(
                "message too small: wanted {} past {}/{}",
                n,
                self.pos,
                self.buf.len()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Whether the cursor has consumed the whole frame.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Read a u8.
    pub fn u8(&mut self) -> ElgaResult<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read a little-endian u32.
    pub fn u32(&mut self) -> ElgaResult<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("len 4")))
    }

    /// Read a little-endian i32.
    pub fn i32(&mut self) -> ElgaResult<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().expect("len 4")))
    }

    /// Read a little-endian u64.
    pub fn u64(&mut self) -> ElgaResult<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("len 8")))
    }

    /// Read a little-endian i64.
    pub fn i64(&mut self) -> ElgaResult<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().expect("len 8")))
    }

    /// Read a little-endian f64.
    pub fn f64(&mut self) -> ElgaResult<f64> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().expect("len 8")))
    }

    /// Read raw bytes.
    pub fn raw(&mut self, n: usize) -> ElgaResult<&'a [u8]> {
        self.take(n)
    }

    /// Read an update.
    pub fn update(&mut self) -> ElgaResult<Update> {
        let src: Vertex = self.u64()?;
        let dst: Vertex = self.u64()?;
        let dir = self.u32()?;
        let insert = self.u32()?;
        let dir = Dir::from_u32(dir)
            .ok_or_else(|| ElgaError::protocol(format!("bad edge direction: {dir}")))?;
        Ok(Update::new(Edge::new(src, dst), dir, insert != 0))
    }

    /// Read every remaining u64 in the frame.
    pub fn u64_rest(&mut self) -> ElgaResult<Vec<u64>> {
        if self.remaining() % 8 != 0 {
            return Err(ElgaError::protocol("trailing bytes in u64 list"));
        }
        let mut out = Vec::with_capacity(self.remaining() / 8);
        while !self.is_empty() {
            out.push(self.u64()?);
        }
        Ok(out)
    }

    /// Read every remaining update in the frame.
    pub fn update_rest(&mut self) -> ElgaResult<Vec<Update>> {
        if self.remaining() % UPDATE_WIRE_SIZE != 0 {
            return Err(ElgaError::protocol("trailing bytes in update list"));
        }
        let mut out = Vec::with_capacity(self.remaining() / UPDATE_WIRE_SIZE);
        while !self.is_empty() {
            out.push(self.update()?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn scalar_round_trip() {
        let mut p = Packer::new();
        p.u8(7).u32(0xdead_beef).u64(u64::MAX - 3).i64(-12).f64(0.25).i32(-1);
        let b = p.freeze();
        assert_eq!(1 + 4 + 8 + 8 + 8 + 4, b.len());

        let mut u = Unpacker::new(&b);
        assert_eq!(7, u.u8().unwrap());
        assert_eq!(0xdead_beef, u.u32().unwrap());
        assert_eq!(u64::MAX - 3, u.u64().unwrap());
        assert_eq!(-12, u.i64().unwrap());
        assert_eq!(0.25, u.f64().unwrap());
        assert_eq!(-1, u.i32().unwrap());
        assert!(u.is_empty());
    }

    #[test]
    fn update_round_trip() {
        for upd in [
            Update::new(Edge::new(0, 1), Dir::In, true),
            Update::new(Edge::new(u64::MAX, 17), Dir::Out, false),
        ] {
            let mut p = Packer::new();
            p.update(&upd);
            let b = p.freeze();
            assert_eq!(UPDATE_WIRE_SIZE, b.len());
            assert_eq!(upd, Unpacker::new(&b).update().unwrap());
        }
    }

    #[test]
    fn update_rejects_bad_direction() {
        let mut p = Packer::new();
        p.u64(1).u64(2).u32(9).u32(1);
        let b = p.freeze();
        assert!(Unpacker::new(&b).update().is_err());
    }

    #[test]
    fn short_read_is_protocol_error() {
        let mut u = Unpacker::new(&[1, 2, 3]);
        assert!(u.u64().is_err());
    }

    #[test]
    fn vagent_packing() {
        let serial = crate::Address::parse("10.1.2.3", 6).unwrap().serial();
        let packed = pack_vagent(serial, 0x3abc);
        let (s, a) = unpack_vagent(packed);
        assert_eq!(serial, s);
        assert_eq!(0x3abc, a);

        // The serial survives untouched in the low 49 bits.
        assert_eq!(serial, packed & VAGENT_SERIAL_MASK);
    }

    #[test]
    fn rest_readers() {
        let mut p = Packer::new();
        p.u64(4).u64(5).u64(6);
        let b = p.freeze();
        assert_eq!(vec![4, 5, 6], Unpacker::new(&b).u64_rest().unwrap());

        let mut p = Packer::new();
        p.update(&Update::new(Edge::new(1, 2), Dir::In, true));
        p.update(&Update::new(Edge::new(2, 3), Dir::Out, true));
        let b = p.freeze();
        assert_eq!(2, Unpacker::new(&b).update_rest().unwrap().len());

        assert!(Unpacker::new(&[0u8; 9]).u64_rest().is_err());
    }
}
