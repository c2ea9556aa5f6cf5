// Navigation layer
// Rate-decoupled delivery of transformed tool poses to viewports

pub mod controller;
pub mod throttle;
pub mod viewport;

pub use controller::{NavigationController, NavigationMode, NavigationState, NavigationStatus};
pub use throttle::EmissionThrottle;
pub use viewport::{LoggingViewportAdapter, ViewportAdapter, ViewportBindings};
