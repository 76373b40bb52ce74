//! 隐私层：可逆实体脱敏

pub mod masker;

pub use masker::{Masker, MaskingTable};
