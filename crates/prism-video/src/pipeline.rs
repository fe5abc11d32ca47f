//! Pipeline layouts and pipelines
//!
//! Graphics and compute pipelines share a layout, creation flags and a label;
//! those live in [`PipelineCommon`] and the variant-specific state in the
//! two variants of [`Pipeline`].

use std::borrow::Cow;
use std::sync::Arc;

use anyhow::{bail, Result};
use bitflags::bitflags;
use wgpu::{PrimitiveTopology, ShaderStages};

use crate::command::PipelineBindPoint;
use crate::descriptor::DescriptorSetLayout;
use crate::{next_object_id, ObjectId};

/// Maximum descriptor sets a pipeline layout may reference
pub const MAX_DESCRIPTOR_SETS: usize = 4;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PipelineCreateFlags: u32 {
        const DISABLE_OPTIMIZATIONS = 1 << 0;
        const ALLOW_DERIVATIVES = 1 << 1;
        const DERIVATIVE = 1 << 2;
        const VIEW_INDEX_FROM_DEVICE_INDEX = 1 << 3;
        const DISPATCH_BASE = 1 << 4;
        const CAPTURE_STATISTICS = 1 << 6;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushConstantRange {
    pub stages: ShaderStages,
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug)]
pub struct PipelineLayout {
    id: ObjectId,
    push_constant_ranges: Vec<PushConstantRange>,
    set_layouts: Vec<Option<Arc<DescriptorSetLayout>>>,
}

impl PipelineLayout {
    pub fn new(
        push_constant_ranges: &[PushConstantRange],
        set_layouts: Vec<Option<Arc<DescriptorSetLayout>>>,
    ) -> Result<Self> {
        if set_layouts.len() > MAX_DESCRIPTOR_SETS {
            bail!(
                "pipeline layout references {} descriptor sets, at most {} allowed",
                set_layouts.len(),
                MAX_DESCRIPTOR_SETS
            );
        }
        for range in push_constant_ranges {
            if range.offset % 4 != 0 || range.size % 4 != 0 || range.size == 0 {
                bail!(
                    "push constant range {}+{} must be non-empty and 4-byte aligned",
                    range.offset,
                    range.size
                );
            }
        }
        Ok(Self {
            id: next_object_id(),
            push_constant_ranges: push_constant_ranges.to_vec(),
            set_layouts,
        })
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn push_constant_ranges(&self) -> &[PushConstantRange] {
        &self.push_constant_ranges
    }

    pub fn set_layout(&self, set: u32) -> Option<&Arc<DescriptorSetLayout>> {
        self.set_layouts.get(set as usize)?.as_ref()
    }

    /// True when `[offset, offset+size)` is covered by ranges visible to `stages`
    pub fn covers_push_constants(&self, stages: ShaderStages, offset: u32, size: u32) -> bool {
        let end = u64::from(offset) + u64::from(size);
        self.push_constant_ranges.iter().any(|r| {
            r.stages.contains(stages)
                && r.offset <= offset
                && end <= u64::from(r.offset) + u64::from(r.size)
        })
    }
}

/// A shader entry point ready for pipeline creation
#[derive(Debug, Clone)]
pub struct SpecializedShader {
    pub label: String,
    pub stage: ShaderStages,
    pub entry_point: String,
    pub source: Cow<'static, str>,
}

impl SpecializedShader {
    pub fn compute(label: impl Into<String>, source: impl Into<Cow<'static, str>>) -> Self {
        Self {
            label: label.into(),
            stage: ShaderStages::COMPUTE,
            entry_point: "main".to_string(),
            source: source.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ComputePipelineCreationParams {
    pub label: Option<String>,
    pub layout: Option<Arc<PipelineLayout>>,
    pub shader: SpecializedShader,
    pub flags: PipelineCreateFlags,
}

impl ComputePipelineCreationParams {
    pub fn validate(&self) -> Result<()> {
        if self.layout.is_none() {
            bail!("compute pipeline requires a layout");
        }
        if self.shader.stage != ShaderStages::COMPUTE {
            bail!(
                "compute pipeline shader {} has stage {:?}",
                self.shader.label,
                self.shader.stage
            );
        }
        if self
            .flags
            .contains(PipelineCreateFlags::VIEW_INDEX_FROM_DEVICE_INDEX)
        {
            bail!("VIEW_INDEX_FROM_DEVICE_INDEX is not valid for compute pipelines");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct GraphicsPipelineCreationParams {
    pub label: Option<String>,
    pub layout: Option<Arc<PipelineLayout>>,
    pub shaders: Vec<SpecializedShader>,
    pub primitive_topology: PrimitiveTopology,
    pub flags: PipelineCreateFlags,
}

impl GraphicsPipelineCreationParams {
    pub fn validate(&self) -> Result<()> {
        if self.layout.is_none() {
            bail!("graphics pipeline requires a layout");
        }
        let mut seen = ShaderStages::empty();
        for shader in &self.shaders {
            if shader.stage.contains(ShaderStages::COMPUTE) {
                bail!("graphics pipeline cannot contain compute shader {}", shader.label);
            }
            if seen.intersects(shader.stage) {
                bail!("shader stage {:?} supplied more than once", shader.stage);
            }
            seen |= shader.stage;
        }
        if !seen.contains(ShaderStages::VERTEX) {
            bail!("graphics pipeline requires a vertex shader");
        }
        if self.flags.contains(PipelineCreateFlags::DISPATCH_BASE) {
            bail!("DISPATCH_BASE is not valid for graphics pipelines");
        }
        Ok(())
    }
}

/// State every pipeline kind carries
#[derive(Debug)]
pub struct PipelineCommon {
    pub id: ObjectId,
    pub label: Option<String>,
    pub layout: Arc<PipelineLayout>,
    pub flags: PipelineCreateFlags,
}

#[derive(Debug)]
pub struct ComputePipeline {
    pub common: PipelineCommon,
    pub shader: SpecializedShader,
}

#[derive(Debug)]
pub struct GraphicsPipeline {
    pub common: PipelineCommon,
    pub shaders: Vec<SpecializedShader>,
    pub primitive_topology: PrimitiveTopology,
}

#[derive(Debug)]
pub enum Pipeline {
    Graphics(GraphicsPipeline),
    Compute(ComputePipeline),
}

impl Pipeline {
    pub fn compute(params: ComputePipelineCreationParams) -> Result<Self> {
        params.validate()?;
        let Some(layout) = params.layout else {
            bail!("compute pipeline requires a layout");
        };
        Ok(Pipeline::Compute(ComputePipeline {
            common: PipelineCommon {
                id: next_object_id(),
                label: params.label,
                layout,
                flags: params.flags,
            },
            shader: params.shader,
        }))
    }

    pub fn graphics(params: GraphicsPipelineCreationParams) -> Result<Self> {
        params.validate()?;
        let Some(layout) = params.layout else {
            bail!("graphics pipeline requires a layout");
        };
        Ok(Pipeline::Graphics(GraphicsPipeline {
            common: PipelineCommon {
                id: next_object_id(),
                label: params.label,
                layout,
                flags: params.flags,
            },
            shaders: params.shaders,
            primitive_topology: params.primitive_topology,
        }))
    }

    pub fn common(&self) -> &PipelineCommon {
        match self {
            Pipeline::Graphics(p) => &p.common,
            Pipeline::Compute(p) => &p.common,
        }
    }

    pub fn id(&self) -> ObjectId {
        self.common().id
    }

    pub fn layout(&self) -> &Arc<PipelineLayout> {
        &self.common().layout
    }

    pub fn bind_point(&self) -> PipelineBindPoint {
        match self {
            Pipeline::Graphics(_) => PipelineBindPoint::Graphics,
            Pipeline::Compute(_) => PipelineBindPoint::Compute,
        }
    }

    pub fn as_compute(&self) -> Option<&ComputePipeline> {
        match self {
            Pipeline::Compute(p) => Some(p),
            Pipeline::Graphics(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> Arc<PipelineLayout> {
        Arc::new(
            PipelineLayout::new(
                &[PushConstantRange {
                    stages: ShaderStages::COMPUTE,
                    offset: 0,
                    size: 8,
                }],
                vec![],
            )
            .unwrap(),
        )
    }

    fn shader(stage: ShaderStages) -> SpecializedShader {
        SpecializedShader {
            stage,
            ..SpecializedShader::compute("test", "")
        }
    }

    #[test]
    fn test_push_constant_coverage() {
        let layout = layout();
        assert!(layout.covers_push_constants(ShaderStages::COMPUTE, 0, 8));
        assert!(layout.covers_push_constants(ShaderStages::COMPUTE, 4, 4));
        assert!(!layout.covers_push_constants(ShaderStages::COMPUTE, 4, 8));
        assert!(!layout.covers_push_constants(ShaderStages::VERTEX, 0, 4));
    }

    #[test]
    fn test_misaligned_push_constant_range_is_rejected() {
        let range = PushConstantRange {
            stages: ShaderStages::COMPUTE,
            offset: 2,
            size: 8,
        };
        assert!(PipelineLayout::new(&[range], vec![]).is_err());
    }

    #[test]
    fn test_compute_validation() {
        let mut params = ComputePipelineCreationParams {
            label: None,
            layout: Some(layout()),
            shader: shader(ShaderStages::COMPUTE),
            flags: PipelineCreateFlags::empty(),
        };
        let pipeline = Pipeline::compute(params.clone()).unwrap();
        assert_eq!(pipeline.bind_point(), PipelineBindPoint::Compute);
        assert!(pipeline.as_compute().is_some());

        params.shader = shader(ShaderStages::FRAGMENT);
        assert!(params.validate().is_err());

        params.shader = shader(ShaderStages::COMPUTE);
        params.layout = None;
        assert!(Pipeline::compute(params).is_err());
    }

    #[test]
    fn test_graphics_validation() {
        let mut params = GraphicsPipelineCreationParams {
            label: Some("quad".into()),
            layout: Some(layout()),
            shaders: vec![shader(ShaderStages::VERTEX), shader(ShaderStages::FRAGMENT)],
            primitive_topology: PrimitiveTopology::TriangleList,
            flags: PipelineCreateFlags::empty(),
        };
        assert!(Pipeline::graphics(params.clone()).is_ok());

        params.shaders.push(shader(ShaderStages::FRAGMENT));
        assert!(params.validate().is_err());

        params.shaders = vec![shader(ShaderStages::FRAGMENT)];
        assert!(params.validate().is_err());

        params.shaders = vec![shader(ShaderStages::VERTEX), shader(ShaderStages::COMPUTE)];
        assert!(params.validate().is_err());
    }
}
