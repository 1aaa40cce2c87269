//! DRM/KMS display output
//!
//! `Device` drives a [`KmsDriver`]: it tracks outputs, framebuffers and the
//! device-wide `current`/`next` pair, and turns per-CRTC flip completions
//! into one completion per frame. `VirtualKms` is an in-memory driver used
//! by the demo and the tests.

mod device;
mod kms;
mod output;
mod virtual_kms;

pub use device::{Device, DisplayOptions, Fb, FbHandle, OutputChanges};
pub use kms::{ConnectorInfo, FlipEvent, FramebufferInfo, KmsDriver, ModeInfo};
pub use output::{Output, OutputId, FAKE_OUTPUT_SIZE};
pub use virtual_kms::VirtualKms;
