//! Pipelines
//!
//! A [`Pipeline`] pairs a [`Shader`] with a fixed-function [`State`]. Both
//! halves are shared and immutable once the pipeline exists; the backend
//! resolves a pipeline into native objects the first time it is bound and
//! keeps the result for as long as the pipeline lives.

pub mod state;

use std::sync::Arc;

use crate::resources::{GpuObject, ResourceId};

pub use state::{
    BlendComponent, BlendFunction, CullMode, DepthBias, DepthTest, State, StateCommand, StateData,
    StateSignature, StencilActivation, StencilFace, StencilTest,
};

/// A logical shader program. Compilation is delegated to the
/// [`ProgramCompiler`](crate::native::ProgramCompiler) the backend owns.
#[derive(Debug)]
pub struct Shader {
    id: ResourceId,
    name: String,
    source: Option<String>,
}

impl GpuObject for Shader {
    fn id(&self) -> ResourceId {
        self.id
    }
}

impl Shader {
    /// A shader known to the compiler by name only.
    #[must_use]
    pub fn named(name: &str) -> Arc<Self> {
        Arc::new(Self {
            id: ResourceId::next(),
            name: name.to_string(),
            source: None,
        })
    }

    #[must_use]
    pub fn from_source(name: &str, source: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: ResourceId::next(),
            name: name.to_string(),
            source: Some(source.into()),
        })
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> ResourceId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }
}

/// Shader program plus render state.
#[derive(Debug)]
pub struct Pipeline {
    id: ResourceId,
    shader: Arc<Shader>,
    state: Arc<State>,
}

impl GpuObject for Pipeline {
    fn id(&self) -> ResourceId {
        self.id
    }
}

impl Pipeline {
    #[must_use]
    pub fn create(shader: Arc<Shader>, state: Arc<State>) -> Arc<Self> {
        Arc::new(Self {
            id: ResourceId::next(),
            shader,
            state,
        })
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> ResourceId {
        self.id
    }

    #[must_use]
    pub fn shader(&self) -> &Arc<Shader> {
        &self.shader
    }

    #[must_use]
    pub fn state(&self) -> &Arc<State> {
        &self.state
    }
}
