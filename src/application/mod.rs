//! Rendering pipeline, outline and the surface that ties them together.

pub mod error;
pub mod render;
pub mod surface;
pub mod toc;
