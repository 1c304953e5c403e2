//! Simulated devices for nanotrack.
//!
//! - [`MockCamera`]: renders Gaussian spots, optionally orbiting, with ROI
//!   support and read-failure injection
//! - [`MockDaq`]: two channels, a sine signal and a square trigger with a
//!   known edge schedule
//!
//! Both implement the capability traits from `nanotrack-core`, so the whole
//! runtime can be exercised without hardware:
//!
//! ```rust,ignore
//! use nanotrack_driver_mock::{MockCamera, MockDaq, Spot};
//!
//! let camera = MockCamera::builder(128, 128)
//!     .spot(Spot::new(40.0, 60.0))
//!     .orbit(3.0, 0.05)
//!     .build();
//! let daq = MockDaq::new(500);
//! ```

mod mock_camera;
mod mock_daq;
mod pattern;

pub use mock_camera::{MockCamera, MockCameraBuilder};
pub use mock_daq::{MockDaq, TRIGGER_HIGH};
pub use pattern::{render_spots, Spot};
