pub mod fixtures;
pub mod mocks;

#[allow(unused_imports)]
pub use fixtures::{chunked, md5_hex, seeded_bytes};
#[allow(unused_imports)]
pub use mocks::InstrumentedBackend;
