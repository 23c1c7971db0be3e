//! Value compression for mutation requests. The wire marks compressed
//! values with the SNAPPY datatype bit, so the compressor works on whole
//! packets and owns the bit transitions in both directions.

use crate::error::{Error, ErrorKind, Result};
use crate::protocol::{Packet, DATATYPE_SNAPPY};

/// A Compressor is used to implement compression of packet values. A default
/// implementation is provided for [`NoCompressor`], as well as
/// [`SnappyCompressor`] when the `snappy` feature is enabled.
pub trait Compressor: Clone + Send + Sync + 'static {
    /// Consume a packet, returning a (possibly) modified packet with the
    /// packet value compressed. This should set the SNAPPY datatype bit iff
    /// the compressed form was kept.
    fn compress(&self, packet: Packet) -> Result<Packet>;
    /// Consume a packet, returning a (possibly) modified packet with the
    /// packet value decompressed and the SNAPPY datatype bit cleared.
    fn decompress(&self, packet: Packet) -> Result<Packet>;
}

/// An implementation of [`Compressor`] that does nothing. This is useful if
/// you want to disable compression.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCompressor;

impl Compressor for NoCompressor {
    fn compress(&self, packet: Packet) -> Result<Packet> {
        Ok(packet)
    }

    fn decompress(&self, packet: Packet) -> Result<Packet> {
        Ok(packet)
    }
}

/// The default minimum value size before compression is attempted.
pub const DEFAULT_MIN_SIZE: usize = 32;
/// The default maximum ratio of compressed to original size worth sending.
pub const DEFAULT_MIN_RATIO: f64 = 0.83;

/// A compressor that implements snappy compression and decompression with a
/// send threshold: values below `min_size` are left alone, and compressed
/// forms are only kept when they shrink the value to at most `min_ratio` of
/// the original.
#[cfg(feature = "snappy")]
#[derive(Debug, Clone, Copy)]
pub struct SnappyCompressor {
    enabled: bool,
    min_size: usize,
    min_ratio: f64,
}

#[cfg(feature = "snappy")]
impl SnappyCompressor {
    pub fn new(enabled: bool, min_size: usize, min_ratio: f64) -> Self {
        Self {
            enabled,
            min_size,
            min_ratio,
        }
    }

    fn update_body_len(packet: &mut Packet) {
        let framing_len = packet.framing_extras.len() as u32;
        let key_len = packet.header.key_length as u32;
        let ext_len = packet.header.extras_length as u32;
        let val_len = packet.value.len() as u32;
        packet.header.body_len = framing_len + key_len + ext_len + val_len;
    }
}

#[cfg(feature = "snappy")]
impl Default for SnappyCompressor {
    fn default() -> Self {
        SnappyCompressor::new(true, DEFAULT_MIN_SIZE, DEFAULT_MIN_RATIO)
    }
}

#[cfg(feature = "snappy")]
impl Compressor for SnappyCompressor {
    fn compress(&self, mut packet: Packet) -> Result<Packet> {
        if !self.enabled || packet.value.len() < self.min_size {
            return Ok(packet);
        }

        let out = snap::raw::Encoder::new()
            .compress_vec(&packet.value)
            .map_err(|_| Error::new(ErrorKind::Compression))?;

        let ratio = out.len() as f64 / packet.value.len() as f64;
        if ratio > self.min_ratio {
            // Not worth the server-side decompression cost.
            return Ok(packet);
        }

        packet.header.data_type |= DATATYPE_SNAPPY;
        packet.value = out;
        Self::update_body_len(&mut packet);
        Ok(packet)
    }

    fn decompress(&self, mut packet: Packet) -> Result<Packet> {
        if packet.header.data_type & DATATYPE_SNAPPY == 0 {
            return Ok(packet);
        }

        let out = snap::raw::Decoder::new()
            .decompress_vec(&packet.value)
            .map_err(|_| Error::new(ErrorKind::Compression))?;

        packet.header.data_type &= !DATATYPE_SNAPPY;
        packet.value = out;
        Self::update_body_len(&mut packet);
        Ok(packet)
    }
}
