// Domain layer: core models and ports (interfaces). No I/O here, only std/serde/phf.

pub mod elements;
pub mod formula;
pub mod model;
pub mod ports;
