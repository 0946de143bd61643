//! Element integration and assembly driving.
//!
//! [`local`] defines the contracts towards the physical integrand, the
//! global-assembly collaborator and the interface checker, together with
//! the per-point element data handed to the integrand. [`driver`] runs the
//! interior, boundary and interface integration loops; [`buffers`] holds
//! the per-thread evaluation scratch the driver reuses across elements.

pub mod buffers;
pub mod driver;
pub mod local;

pub use driver::MixedAssembler;
pub use local::{
    ElementMatrices, GlobalAssembler, Integrand, IntegrandCaps, InterfaceChecker, LocalIntegral,
    MixedElementValues,
};
