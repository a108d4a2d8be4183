#[cfg(unix)]
pub mod eim;
pub mod stub;

#[cfg(unix)]
pub use eim::EimEngine;
pub use stub::StubEngine;
