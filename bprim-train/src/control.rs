//! Interactive control state.
//!
//! One explicit struct holds every value the live client may change. The
//! orchestrator reads it each iteration and also writes to it (mode requests,
//! forcing structural edits off past the deadline).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::mode::Mode;

/// Debug visualization published to the interactive client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderView {
    #[default]
    RawImage,
    DepthMap,
    Segmentation,
    BoundaryOverlay,
    UvwMap,
    GroundTruth,
    SurfaceNormal,
    DepthNormal,
    GradientHeatmap,
    EdgeHeatmap,
    VisibilityHeatmap,
    EdgeMask,
}

impl RenderView {
    pub const ALL: [RenderView; 12] = [
        RenderView::RawImage,
        RenderView::DepthMap,
        RenderView::Segmentation,
        RenderView::BoundaryOverlay,
        RenderView::UvwMap,
        RenderView::GroundTruth,
        RenderView::SurfaceNormal,
        RenderView::DepthNormal,
        RenderView::GradientHeatmap,
        RenderView::EdgeHeatmap,
        RenderView::VisibilityHeatmap,
        RenderView::EdgeMask,
    ];

    /// Label shown by the viewer's dropdown.
    pub fn label(self) -> &'static str {
        match self {
            RenderView::RawImage => "debug",
            RenderView::DepthMap => "Depth Map",
            RenderView::Segmentation => "Segmentation",
            RenderView::BoundaryOverlay => "Colored Boundary Points",
            RenderView::UvwMap => "Colored UVW",
            RenderView::GroundTruth => "GT Image",
            RenderView::SurfaceNormal => "Surface Normal",
            RenderView::DepthNormal => "Depth Normal",
            RenderView::GradientHeatmap => "Accumulated Gradient Image",
            RenderView::EdgeHeatmap => "Accum_Edge",
            RenderView::VisibilityHeatmap => "Accum_Vis",
            RenderView::EdgeMask => "edges",
        }
    }

    fn snake_name(self) -> &'static str {
        match self {
            RenderView::RawImage => "raw_image",
            RenderView::DepthMap => "depth_map",
            RenderView::Segmentation => "segmentation",
            RenderView::BoundaryOverlay => "boundary_overlay",
            RenderView::UvwMap => "uvw_map",
            RenderView::GroundTruth => "ground_truth",
            RenderView::SurfaceNormal => "surface_normal",
            RenderView::DepthNormal => "depth_normal",
            RenderView::GradientHeatmap => "gradient_heatmap",
            RenderView::EdgeHeatmap => "edge_heatmap",
            RenderView::VisibilityHeatmap => "visibility_heatmap",
            RenderView::EdgeMask => "edge_mask",
        }
    }
}

impl fmt::Display for RenderView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.snake_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown render view: {0:?}")]
pub struct UnknownRenderView(pub String);

impl FromStr for RenderView {
    type Err = UnknownRenderView;

    /// Accepts either the snake_case name or the viewer label.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        RenderView::ALL
            .into_iter()
            .find(|view| view.snake_name() == s || view.label() == s)
            .ok_or_else(|| UnknownRenderView(s.to_string()))
    }
}

/// Values the interactive client can read and change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlState {
    /// Requested mode; the state machine decides when it takes effect.
    pub mode: Mode,
    pub training_enabled: bool,
    pub optimizer_step_enabled: bool,
    pub structural_edit_enabled: bool,
    /// Log-scale blur of primitive boundaries.
    pub boundary_scale: f32,
    pub primitive_scale: f32,
    pub segments_per_edge: u32,
    pub render_view: RenderView,
    /// Replaces the position learning rate on the next rebuild.
    pub learning_rate_override: Option<f32>,
    /// Train the point-splat baseline instead of the patches.
    pub point_mode: bool,
}

impl Default for ControlState {
    fn default() -> Self {
        Self {
            mode: Mode::Init,
            training_enabled: true,
            optimizer_step_enabled: true,
            structural_edit_enabled: true,
            boundary_scale: -9.0,
            primitive_scale: 1.0,
            segments_per_edge: 8,
            render_view: RenderView::RawImage,
            learning_rate_override: None,
            point_mode: false,
        }
    }
}

/// One control change sent by the client.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "control", content = "value", rename_all = "snake_case")]
pub enum ControlUpdate {
    Mode(Mode),
    TrainingEnabled(bool),
    OptimizerStepEnabled(bool),
    StructuralEditEnabled(bool),
    BoundaryScale(f32),
    PrimitiveScale(f32),
    SegmentsPerEdge(u32),
    RenderView(RenderView),
    LearningRateOverride(Option<f32>),
    PointMode(bool),
}

impl ControlState {
    pub fn apply(&mut self, update: ControlUpdate) {
        match update {
            ControlUpdate::Mode(mode) => self.mode = mode,
            ControlUpdate::TrainingEnabled(v) => self.training_enabled = v,
            ControlUpdate::OptimizerStepEnabled(v) => self.optimizer_step_enabled = v,
            ControlUpdate::StructuralEditEnabled(v) => self.structural_edit_enabled = v,
            ControlUpdate::BoundaryScale(v) => self.boundary_scale = v,
            ControlUpdate::PrimitiveScale(v) => self.primitive_scale = v,
            ControlUpdate::SegmentsPerEdge(v) => self.segments_per_edge = v.max(1),
            ControlUpdate::RenderView(view) => self.render_view = view,
            ControlUpdate::LearningRateOverride(v) => {
                self.learning_rate_override = v.filter(|rate| rate.is_finite() && *rate > 0.0)
            }
            ControlUpdate::PointMode(v) => self.point_mode = v,
        }
    }
}
