//! PPMd variant H, as used by RAR 2.9 blocks with the PPM flag.
//!
//! Dmitry Shkarin's context model with the RAR flavour of the range coder.
//! Bytes of the coded stream are read through the same [`BitReader`] as
//! the surrounding LZ blocks.
//!
//! [`BitReader`]: super::BitReader

mod model;
mod range_coder;
mod sub_alloc;

pub use model::PpmModel;
pub use range_coder::RangeCoder;

#[cfg(test)]
pub(crate) use range_coder::RangeEncoder;
