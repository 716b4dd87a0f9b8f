//! Fixed-function render state.
//!
//! A [`State`] stores every fixed-function field together with a
//! [`StateSignature`] holding one bit per field whose value differs from the
//! default. The backend only ever issues [`StateCommand`]s for signature
//! bits, and resets fields a previous state touched back to their defaults.

use smallvec::SmallVec;

use crate::resources::{GpuObject, ResourceId};

// ─── Field Types ──────────────────────────────────────────────────────────────

/// Face culling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    #[default]
    None,
    Front,
    Back,
}

impl CullMode {
    #[must_use]
    pub fn to_wgpu(self) -> Option<wgpu::Face> {
        match self {
            Self::None => None,
            Self::Front => Some(wgpu::Face::Front),
            Self::Back => Some(wgpu::Face::Back),
        }
    }
}

/// Depth test configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthTest {
    pub enabled: bool,
    pub write_mask: bool,
    pub function: wgpu::CompareFunction,
}

impl Default for DepthTest {
    fn default() -> Self {
        Self {
            enabled: false,
            write_mask: true,
            function: wgpu::CompareFunction::Less,
        }
    }
}

impl DepthTest {
    #[must_use]
    pub const fn new(enabled: bool, write_mask: bool, function: wgpu::CompareFunction) -> Self {
        Self {
            enabled,
            write_mask,
            function,
        }
    }
}

/// Stencil configuration of one face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StencilFace {
    pub function: wgpu::CompareFunction,
    pub reference: u8,
    pub read_mask: u8,
    pub fail_op: wgpu::StencilOperation,
    pub depth_fail_op: wgpu::StencilOperation,
    pub pass_op: wgpu::StencilOperation,
}

impl Default for StencilFace {
    fn default() -> Self {
        Self {
            function: wgpu::CompareFunction::Always,
            reference: 0,
            read_mask: 0xFF,
            fail_op: wgpu::StencilOperation::Keep,
            depth_fail_op: wgpu::StencilOperation::Keep,
            pass_op: wgpu::StencilOperation::Keep,
        }
    }
}

impl StencilFace {
    /// Passes where `stencil & read_mask == reference & read_mask` and keeps
    /// the stencil buffer untouched.
    #[must_use]
    pub fn test_equal(reference: u8, read_mask: u8) -> Self {
        Self {
            function: wgpu::CompareFunction::Equal,
            reference,
            read_mask,
            ..Self::default()
        }
    }

    /// Always passes and writes `reference` on pass.
    #[must_use]
    pub fn write(reference: u8) -> Self {
        Self {
            function: wgpu::CompareFunction::Always,
            reference,
            pass_op: wgpu::StencilOperation::Replace,
            ..Self::default()
        }
    }
}

/// Stencil test for both faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StencilTest {
    pub enabled: bool,
    pub front: StencilFace,
    pub back: StencilFace,
}

impl StencilTest {
    #[must_use]
    pub fn both(face: StencilFace) -> Self {
        Self {
            enabled: true,
            front: face,
            back: face,
        }
    }
}

/// Stencil write activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StencilActivation {
    pub enabled: bool,
    pub write_mask: u8,
}

impl Default for StencilActivation {
    fn default() -> Self {
        Self {
            enabled: false,
            write_mask: 0xFF,
        }
    }
}

/// Hashable mirror of `wgpu::BlendComponent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendComponent {
    pub src_factor: wgpu::BlendFactor,
    pub dst_factor: wgpu::BlendFactor,
    pub operation: wgpu::BlendOperation,
}

impl Default for BlendComponent {
    fn default() -> Self {
        wgpu::BlendComponent::REPLACE.into()
    }
}

impl From<wgpu::BlendComponent> for BlendComponent {
    fn from(b: wgpu::BlendComponent) -> Self {
        Self {
            src_factor: b.src_factor,
            dst_factor: b.dst_factor,
            operation: b.operation,
        }
    }
}

/// Blend configuration for color and alpha.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BlendFunction {
    pub enabled: bool,
    pub color: BlendComponent,
    pub alpha: BlendComponent,
}

impl BlendFunction {
    #[must_use]
    pub fn from_wgpu(state: wgpu::BlendState) -> Self {
        Self {
            enabled: true,
            color: state.color.into(),
            alpha: state.alpha.into(),
        }
    }

    /// Premultiplied-style alpha blending used by transparent passes.
    #[must_use]
    pub fn alpha_blending() -> Self {
        Self::from_wgpu(wgpu::BlendState::ALPHA_BLENDING)
    }

    /// Additive blending used by light accumulation.
    #[must_use]
    pub fn additive() -> Self {
        let add = wgpu::BlendComponent {
            src_factor: wgpu::BlendFactor::One,
            dst_factor: wgpu::BlendFactor::One,
            operation: wgpu::BlendOperation::Add,
        };
        Self {
            enabled: true,
            color: add.into(),
            alpha: add.into(),
        }
    }
}

/// Polygon offset.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DepthBias {
    pub constant: f32,
    pub slope_scale: f32,
}

// ─── Signature ────────────────────────────────────────────────────────────────

bitflags::bitflags! {
    /// One bit per fixed-function field set to a non-default value.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StateSignature: u32 {
        const FILL_MODE               = 1 << 0;
        const CULL_MODE               = 1 << 1;
        const FRONT_FACE_CLOCKWISE    = 1 << 2;
        const DEPTH_CLAMP_ENABLE      = 1 << 3;
        const SCISSOR_ENABLE          = 1 << 4;
        const MULTISAMPLE_ENABLE      = 1 << 5;
        const ANTIALIASED_LINE_ENABLE = 1 << 6;
        const DEPTH_BIAS              = 1 << 7;
        const DEPTH_TEST              = 1 << 8;
        const STENCIL_ACTIVATION      = 1 << 9;
        const STENCIL_TEST            = 1 << 10;
        const SAMPLE_MASK             = 1 << 11;
        const ALPHA_TO_COVERAGE       = 1 << 12;
        const BLEND_FUNCTION          = 1 << 13;
        const COLOR_WRITE_MASK        = 1 << 14;
    }
}

/// A single fixed-function state change.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StateCommand {
    FillMode(wgpu::PolygonMode),
    CullMode(CullMode),
    FrontFaceClockwise(bool),
    DepthClampEnable(bool),
    ScissorEnable(bool),
    MultisampleEnable(bool),
    AntialiasedLineEnable(bool),
    DepthBias(DepthBias),
    DepthTest(DepthTest),
    StencilActivation(StencilActivation),
    StencilTest(StencilTest),
    SampleMask(u32),
    AlphaToCoverage(bool),
    BlendFunction(BlendFunction),
    ColorWriteMask(wgpu::ColorWrites),
}

impl StateCommand {
    /// The signature bit this command writes.
    #[must_use]
    pub fn field(&self) -> StateSignature {
        match self {
            Self::FillMode(_) => StateSignature::FILL_MODE,
            Self::CullMode(_) => StateSignature::CULL_MODE,
            Self::FrontFaceClockwise(_) => StateSignature::FRONT_FACE_CLOCKWISE,
            Self::DepthClampEnable(_) => StateSignature::DEPTH_CLAMP_ENABLE,
            Self::ScissorEnable(_) => StateSignature::SCISSOR_ENABLE,
            Self::MultisampleEnable(_) => StateSignature::MULTISAMPLE_ENABLE,
            Self::AntialiasedLineEnable(_) => StateSignature::ANTIALIASED_LINE_ENABLE,
            Self::DepthBias(_) => StateSignature::DEPTH_BIAS,
            Self::DepthTest(_) => StateSignature::DEPTH_TEST,
            Self::StencilActivation(_) => StateSignature::STENCIL_ACTIVATION,
            Self::StencilTest(_) => StateSignature::STENCIL_TEST,
            Self::SampleMask(_) => StateSignature::SAMPLE_MASK,
            Self::AlphaToCoverage(_) => StateSignature::ALPHA_TO_COVERAGE,
            Self::BlendFunction(_) => StateSignature::BLEND_FUNCTION,
            Self::ColorWriteMask(_) => StateSignature::COLOR_WRITE_MASK,
        }
    }

    /// The command restoring `field` to its default value.
    ///
    /// `field` must be a single signature bit.
    #[must_use]
    pub fn reset(field: StateSignature) -> Option<Self> {
        StateData::default().command_for(field)
    }
}

// ─── State Data ───────────────────────────────────────────────────────────────

/// Values of every fixed-function field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateData {
    pub fill_mode: wgpu::PolygonMode,
    pub cull_mode: CullMode,
    pub front_face_clockwise: bool,
    pub depth_clamp_enable: bool,
    pub scissor_enable: bool,
    pub multisample_enable: bool,
    pub antialiased_line_enable: bool,
    pub depth_bias: DepthBias,
    pub depth_test: DepthTest,
    pub stencil_activation: StencilActivation,
    pub stencil_test: StencilTest,
    pub sample_mask: u32,
    pub alpha_to_coverage: bool,
    pub blend_function: BlendFunction,
    pub color_write_mask: wgpu::ColorWrites,
}

impl Default for StateData {
    fn default() -> Self {
        Self {
            fill_mode: wgpu::PolygonMode::Fill,
            cull_mode: CullMode::None,
            front_face_clockwise: false,
            depth_clamp_enable: false,
            scissor_enable: false,
            multisample_enable: true,
            antialiased_line_enable: true,
            depth_bias: DepthBias::default(),
            depth_test: DepthTest::default(),
            stencil_activation: StencilActivation::default(),
            stencil_test: StencilTest::default(),
            sample_mask: u32::MAX,
            alpha_to_coverage: false,
            blend_function: BlendFunction::default(),
            color_write_mask: wgpu::ColorWrites::ALL,
        }
    }
}

impl StateData {
    /// Command writing the current value of a single `field`.
    #[must_use]
    pub fn command_for(&self, field: StateSignature) -> Option<StateCommand> {
        if field.bits().count_ones() != 1 {
            return None;
        }
        // Bit positions of `StateSignature`.
        let command = match field.bits().trailing_zeros() {
            0 => StateCommand::FillMode(self.fill_mode),
            1 => StateCommand::CullMode(self.cull_mode),
            2 => StateCommand::FrontFaceClockwise(self.front_face_clockwise),
            3 => StateCommand::DepthClampEnable(self.depth_clamp_enable),
            4 => StateCommand::ScissorEnable(self.scissor_enable),
            5 => StateCommand::MultisampleEnable(self.multisample_enable),
            6 => StateCommand::AntialiasedLineEnable(self.antialiased_line_enable),
            7 => StateCommand::DepthBias(self.depth_bias),
            8 => StateCommand::DepthTest(self.depth_test),
            9 => StateCommand::StencilActivation(self.stencil_activation),
            10 => StateCommand::StencilTest(self.stencil_test),
            11 => StateCommand::SampleMask(self.sample_mask),
            12 => StateCommand::AlphaToCoverage(self.alpha_to_coverage),
            13 => StateCommand::BlendFunction(self.blend_function),
            14 => StateCommand::ColorWriteMask(self.color_write_mask),
            _ => return None,
        };
        Some(command)
    }

    /// Writes the value carried by `command` into the matching field.
    pub fn apply(&mut self, command: &StateCommand) {
        match *command {
            StateCommand::FillMode(v) => self.fill_mode = v,
            StateCommand::CullMode(v) => self.cull_mode = v,
            StateCommand::FrontFaceClockwise(v) => self.front_face_clockwise = v,
            StateCommand::DepthClampEnable(v) => self.depth_clamp_enable = v,
            StateCommand::ScissorEnable(v) => self.scissor_enable = v,
            StateCommand::MultisampleEnable(v) => self.multisample_enable = v,
            StateCommand::AntialiasedLineEnable(v) => self.antialiased_line_enable = v,
            StateCommand::DepthBias(v) => self.depth_bias = v,
            StateCommand::DepthTest(v) => self.depth_test = v,
            StateCommand::StencilActivation(v) => self.stencil_activation = v,
            StateCommand::StencilTest(v) => self.stencil_test = v,
            StateCommand::SampleMask(v) => self.sample_mask = v,
            StateCommand::AlphaToCoverage(v) => self.alpha_to_coverage = v,
            StateCommand::BlendFunction(v) => self.blend_function = v,
            StateCommand::ColorWriteMask(v) => self.color_write_mask = v,
        }
    }

    /// Signature bits of the fields that differ from the defaults.
    #[must_use]
    pub fn signature(&self) -> StateSignature {
        let defaults = Self::default();
        StateSignature::all()
            .iter()
            .filter(|field| self.command_for(*field) != defaults.command_for(*field))
            .collect()
    }
}

// ─── State ────────────────────────────────────────────────────────────────────

/// A fixed-function render state with identity.
#[derive(Debug)]
pub struct State {
    id: ResourceId,
    data: StateData,
    signature: StateSignature,
}

impl GpuObject for State {
    fn id(&self) -> ResourceId {
        self.id
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: ResourceId::next(),
            data: StateData::default(),
            signature: StateSignature::empty(),
        }
    }

    #[must_use]
    pub fn from_data(data: StateData) -> Self {
        Self {
            id: ResourceId::next(),
            signature: data.signature(),
            data,
        }
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> ResourceId {
        self.id
    }

    #[must_use]
    pub fn data(&self) -> &StateData {
        &self.data
    }

    #[must_use]
    pub fn signature(&self) -> StateSignature {
        self.signature
    }

    /// The ordered state-change commands for every signature bit.
    #[must_use]
    pub fn commands(&self) -> SmallVec<[StateCommand; 8]> {
        self.signature
            .iter()
            .filter_map(|field| self.data.command_for(field))
            .collect()
    }

    fn set(&mut self, command: StateCommand) {
        let field = command.field();
        self.data.apply(&command);
        let is_default = StateCommand::reset(field) == Some(command);
        self.signature.set(field, !is_default);
    }

    pub fn set_fill_mode(&mut self, mode: wgpu::PolygonMode) {
        self.set(StateCommand::FillMode(mode));
    }

    pub fn set_cull_mode(&mut self, mode: CullMode) {
        self.set(StateCommand::CullMode(mode));
    }

    pub fn set_front_face_clockwise(&mut self, clockwise: bool) {
        self.set(StateCommand::FrontFaceClockwise(clockwise));
    }

    pub fn set_depth_clamp_enable(&mut self, enable: bool) {
        self.set(StateCommand::DepthClampEnable(enable));
    }

    pub fn set_scissor_enable(&mut self, enable: bool) {
        self.set(StateCommand::ScissorEnable(enable));
    }

    pub fn set_multisample_enable(&mut self, enable: bool) {
        self.set(StateCommand::MultisampleEnable(enable));
    }

    pub fn set_antialiased_line_enable(&mut self, enable: bool) {
        self.set(StateCommand::AntialiasedLineEnable(enable));
    }

    pub fn set_depth_bias(&mut self, constant: f32, slope_scale: f32) {
        self.set(StateCommand::DepthBias(DepthBias {
            constant,
            slope_scale,
        }));
    }

    pub fn set_depth_test(&mut self, test: DepthTest) {
        self.set(StateCommand::DepthTest(test));
    }

    pub fn set_stencil_activation(&mut self, enabled: bool, write_mask: u8) {
        self.set(StateCommand::StencilActivation(StencilActivation {
            enabled,
            write_mask,
        }));
    }

    pub fn set_stencil_test(&mut self, test: StencilTest) {
        self.set(StateCommand::StencilTest(test));
    }

    pub fn set_sample_mask(&mut self, mask: u32) {
        self.set(StateCommand::SampleMask(mask));
    }

    pub fn set_alpha_to_coverage(&mut self, enable: bool) {
        self.set(StateCommand::AlphaToCoverage(enable));
    }

    pub fn set_blend_function(&mut self, blend: BlendFunction) {
        self.set(StateCommand::BlendFunction(blend));
    }

    pub fn set_color_write_mask(&mut self, mask: wgpu::ColorWrites) {
        self.set(StateCommand::ColorWriteMask(mask));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_state_has_empty_signature() {
        let state = State::new();
        assert!(state.signature().is_empty());
        assert!(state.commands().is_empty());
    }

    #[test]
    fn setting_back_to_default_clears_the_bit() {
        let mut state = State::new();
        state.set_cull_mode(CullMode::Back);
        assert_eq!(state.signature(), StateSignature::CULL_MODE);

        state.set_cull_mode(CullMode::None);
        assert!(state.signature().is_empty());
    }

    #[test]
    fn commands_follow_signature_order() {
        let mut state = State::new();
        state.set_blend_function(BlendFunction::alpha_blending());
        state.set_cull_mode(CullMode::Back);

        let commands = state.commands();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0], StateCommand::CullMode(CullMode::Back));
        assert!(matches!(commands[1], StateCommand::BlendFunction(b) if b.enabled));
    }

    #[test]
    fn from_data_computes_signature() {
        let data = StateData {
            depth_test: DepthTest::new(true, true, wgpu::CompareFunction::LessEqual),
            color_write_mask: wgpu::ColorWrites::COLOR,
            ..StateData::default()
        };
        let state = State::from_data(data);
        assert_eq!(
            state.signature(),
            StateSignature::DEPTH_TEST | StateSignature::COLOR_WRITE_MASK
        );
    }

    #[test]
    fn reset_commands_restore_defaults() {
        let mut data = StateData {
            cull_mode: CullMode::Front,
            ..StateData::default()
        };
        let reset = StateCommand::reset(StateSignature::CULL_MODE).unwrap();
        data.apply(&reset);
        assert_eq!(data, StateData::default());
    }
}
