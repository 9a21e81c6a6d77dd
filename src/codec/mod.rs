//! Binary wire codec shared by entities and protocol messages

pub mod wire;

pub use wire::{
    CodecError, Decode, Encode, WireReader, WireWriter, MAX_FIELD_LEN, MAX_NESTING_DEPTH, TAG_LEN,
};
