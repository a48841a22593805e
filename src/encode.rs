//! Serialize data into the bytecode protocol.
//!
//! Request bodies handed to [`Broker::call`](crate::prelude::Broker::call)
//! are opaque to the engine; these are the building blocks callers use to
//! produce them, and what the engine itself uses for the request header.
use bytes::{BufMut, Bytes};

use crate::error::{Error, Result};

/// Big-endian encoding onto any [`BufMut`].
///
/// All integers are two's complement big-endian. Strings carry an `i16`
/// length prefix, byte blobs an `i32` one, and `-1` in the prefix position
/// denotes null.
pub trait ToByte {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()>;
}

impl<'a, T: ToByte + 'a + ?Sized> ToByte for &'a T {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        (*self).encode(buffer)
    }
}

impl ToByte for i8 {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_i8(*self);
        Ok(())
    }
}

impl ToByte for i16 {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_i16(*self);
        Ok(())
    }
}

impl ToByte for i32 {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_i32(*self);
        Ok(())
    }
}

impl ToByte for i64 {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_i64(*self);
        Ok(())
    }
}

impl ToByte for str {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        let len = i16::try_from(self.len()).map_err(|_| Error::EncodingError)?;
        buffer.put_i16(len);
        buffer.put(self.as_bytes());
        Ok(())
    }
}

impl ToByte for String {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.as_str().encode(buffer)
    }
}

impl<'a> ToByte for Option<&'a str> {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        match *self {
            Some(s) => s.encode(buffer),
            None => (-1i16).encode(buffer),
        }
    }
}

impl ToByte for [u8] {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        let len = i32::try_from(self.len()).map_err(|_| Error::EncodingError)?;
        buffer.put_i32(len);
        buffer.put(self);
        Ok(())
    }
}

impl ToByte for Bytes {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.as_ref().encode(buffer)
    }
}

impl ToByte for Option<Bytes> {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        match self {
            Some(b) => b.encode(buffer),
            None => (-1i32).encode(buffer),
        }
    }
}

/// Renders the length of `xs` as the start of a protocol array, then each
/// element through `f`.
pub fn encode_as_array<T, F, W>(buffer: &mut W, xs: &[T], mut f: F) -> Result<()>
where
    F: FnMut(&mut W, &T) -> Result<()>,
    W: BufMut,
{
    let len = i32::try_from(xs.len()).map_err(|_| Error::EncodingError)?;
    buffer.put_i32(len);
    for x in xs {
        f(buffer, x)?;
    }
    Ok(())
}

impl<V: ToByte> ToByte for [V] {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        encode_as_array(buffer, self, |buffer, x| x.encode(buffer))
    }
}
