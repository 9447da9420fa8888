//! GL-to-second-API render target sharing.
//!
//! This crate defines the [`SharedSurfaceBridge`] trait, the protocol the
//! render worker follows to draw with OpenGL straight into a surface owned
//! by another graphics API. On Windows the surface is a D3D11 texture shared
//! through `WGL_NV_DX_interop2`.

pub mod bridge;
pub use bridge::{PresentError, SharedHandle, SharedSurfaceBridge};

#[cfg(target_os = "windows")]
pub mod dx11;
