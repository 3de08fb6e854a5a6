//! Pipeline and descriptor factory
//!
//! Builds, at startup and again on any swap-chain/format change, the
//! complete fixed catalog of pipeline objects the renderer's draw
//! passes bind: world-surface variants, 2D/basic variants, water, sky,
//! particles, sprites, animated models, and the post-process chain.
//! The catalog is a keyed map built from a declarative table; draw
//! code selects variants at bind time by game-state policy.
//!
//! Construction order: descriptor-set layouts, pipeline layouts,
//! pipeline objects, samplers, descriptor pool and sets. Destruction
//! runs in exact reverse order and only after the device is idle.

use crate::context::{DeviceContext, VulkanError, VulkanResult};
use crate::descriptor::{DescriptorLayouts, DescriptorPool};
use crate::render_pass::RenderPassRegistry;
use crate::shader::ShaderModule;
use crate::vertex::{AliasVertex, BasicVertex, WorldVertex};
use crate::NUM_COLOR_BUFFERS;
use ash::{vk, Device};
use bitflags::bitflags;
use std::collections::HashMap;
use std::path::Path;

/// Number of world-surface pipeline variants (every combination of
/// [`VariantFlags::ALPHA_TEST`], [`VariantFlags::ALPHA_BLEND`] and
/// [`VariantFlags::FOG`])
pub const WORLD_PIPELINE_COUNT: usize = 8;

bitflags! {
    /// Fixed-function variant selector within a draw pass
    ///
    /// Which bits are meaningful depends on the pass; mutually
    /// exclusive style bits (sky) are documented on the pass.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VariantFlags: u32 {
        /// Discard fragments below the alpha threshold
        const ALPHA_TEST = 1 << 0;
        /// Alpha blending, depth writes off
        const ALPHA_BLEND = 1 << 1;
        /// Fog-blended geometry
        const FOG = 1 << 2;
        /// Untextured (vertex color only)
        const NO_TEXTURE = 1 << 3;
        /// Full-screen view flash drawn inside the scene pass
        const POLY_BLEND = 1 << 4;
        /// Sky style: cubemap box (exclusive with `SKY_LAYER`)
        const SKY_BOX = 1 << 5;
        /// Sky style: scrolling cloud layers (exclusive with `SKY_BOX`)
        const SKY_LAYER = 1 << 6;
        /// Depth-tested wireframe overlay
        const DEPTH_TEST = 1 << 7;
    }
}

/// Draw pass a pipeline serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DrawPass {
    /// Lightmapped brush geometry
    World,
    /// 2D/UI quads and untextured fills
    Basic,
    /// Liquid surfaces
    Water,
    /// Rasterized texture warp (liquid texture animation)
    TexWarp,
    /// Particle billboards
    Particle,
    /// Sprite models
    Sprite,
    /// Sky dome
    Sky,
    /// Animated (alias) models
    Alias,
    /// Scene-to-swapchain composite with gamma/contrast
    Postprocess,
    /// Full-screen underwater warp
    ScreenWarp,
    /// Compute-shader texture warp
    TexWarpCompute,
    /// Debug wireframe overlay
    ShowTris,
    /// Color grading
    Grade,
    /// Separable blur
    Blur,
}

/// Catalog key: pass plus variant flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    /// Draw pass
    pub pass: DrawPass,
    /// Variant within the pass
    pub variant: VariantFlags,
}

impl PipelineKey {
    /// Key for the unflagged variant of a pass
    pub fn base(pass: DrawPass) -> Self {
        Self {
            pass,
            variant: VariantFlags::empty(),
        }
    }

    /// Key for a flagged variant
    pub fn with(pass: DrawPass, variant: VariantFlags) -> Self {
        Self { pass, variant }
    }
}

/// An immutable pipeline object from the catalog
pub struct Pipeline {
    pub(crate) device: Device,
    /// Pipeline handle
    pub handle: vk::Pipeline,
    /// Graphics or compute
    pub bind_point: vk::PipelineBindPoint,
    /// Layout used for push constants and descriptor binding
    pub layout: vk::PipelineLayout,
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.handle, None);
        }
    }
}

/// Which pipeline layout a catalog entry binds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LayoutId {
    Basic,
    World,
    SkyLayer,
    Alias,
    Postprocess,
    ScreenWarp,
    TexWarpCompute,
    ShowTris,
    Grade,
    Blur,
}

/// Which render pass a catalog entry is compiled against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassTarget {
    Main,
    Ui,
    Warp,
}

/// Vertex input consumed by a catalog entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VertexInput {
    Basic,
    World,
    Alias,
    /// Fullscreen triangle generated in the vertex shader
    None,
}

/// One row of the declarative pipeline table
struct PipelineDesc {
    key: PipelineKey,
    name: &'static str,
    vertex_shader: &'static str,
    fragment_shader: &'static str,
    layout: LayoutId,
    target: PassTarget,
    vertex_input: VertexInput,
    depth_test: bool,
    depth_write: bool,
    blend: bool,
    cull_back: bool,
    line_mode: bool,
}

impl PipelineDesc {
    #[allow(clippy::too_many_arguments)]
    fn new(
        key: PipelineKey,
        name: &'static str,
        vertex_shader: &'static str,
        fragment_shader: &'static str,
        layout: LayoutId,
        target: PassTarget,
        vertex_input: VertexInput,
        depth_test: bool,
        depth_write: bool,
        blend: bool,
    ) -> Self {
        Self {
            key,
            name,
            vertex_shader,
            fragment_shader,
            layout,
            target,
            vertex_input,
            depth_test,
            depth_write,
            blend,
            cull_back: false,
            line_mode: false,
        }
    }

    fn culled(mut self) -> Self {
        self.cull_back = true;
        self
    }

    fn wireframe(mut self) -> Self {
        self.line_mode = true;
        self
    }
}

/// The eight world-surface variants plus every fixed catalog entry
fn catalog_table(non_solid_fill: bool) -> Vec<PipelineDesc> {
    use DrawPass as P;
    use VariantFlags as V;

    let mut table = Vec::with_capacity(32);

    // World family: all combinations of alpha test, alpha blend and
    // fog. Blended variants keep depth testing but stop writing.
    for bits in 0..WORLD_PIPELINE_COUNT as u32 {
        let variant = V::from_bits_truncate(bits);
        let alpha_test = variant.contains(V::ALPHA_TEST);
        let blend = variant.contains(V::ALPHA_BLEND);
        let fog = variant.contains(V::FOG);
        let fragment_shader = match (alpha_test, fog) {
            (false, false) => "world",
            (true, false) => "world_alphatest",
            (false, true) => "world_fog",
            (true, true) => "world_alphatest_fog",
        };
        table.push(
            PipelineDesc::new(
                PipelineKey::with(P::World, variant),
                "world",
                "world",
                fragment_shader,
                LayoutId::World,
                PassTarget::Main,
                VertexInput::World,
                true,
                !blend,
                blend,
            )
            .culled(),
        );
    }

    // 2D/basic family
    table.push(PipelineDesc::new(
        PipelineKey::with(P::Basic, V::ALPHA_TEST),
        "basic alphatest",
        "basic",
        "basic_alphatest",
        LayoutId::Basic,
        PassTarget::Ui,
        VertexInput::Basic,
        false,
        false,
        false,
    ));
    table.push(PipelineDesc::new(
        PipelineKey::with(P::Basic, V::ALPHA_BLEND),
        "basic blend",
        "basic",
        "basic",
        LayoutId::Basic,
        PassTarget::Ui,
        VertexInput::Basic,
        false,
        false,
        true,
    ));
    table.push(PipelineDesc::new(
        PipelineKey::with(P::Basic, V::NO_TEXTURE | V::ALPHA_BLEND),
        "basic notex blend",
        "basic",
        "basic_notex",
        LayoutId::Basic,
        PassTarget::Ui,
        VertexInput::Basic,
        false,
        false,
        true,
    ));
    // View flash quad drawn over the 3D scene
    table.push(PipelineDesc::new(
        PipelineKey::with(P::Basic, V::POLY_BLEND),
        "poly blend",
        "basic",
        "basic_notex",
        LayoutId::Basic,
        PassTarget::Main,
        VertexInput::Basic,
        false,
        false,
        true,
    ));

    // Liquids
    table.push(PipelineDesc::new(
        PipelineKey::base(P::Water),
        "water",
        "water",
        "water",
        LayoutId::Basic,
        PassTarget::Main,
        VertexInput::Basic,
        true,
        true,
        false,
    ));
    table.push(PipelineDesc::new(
        PipelineKey::with(P::Water, V::ALPHA_BLEND),
        "water blend",
        "water",
        "water",
        LayoutId::Basic,
        PassTarget::Main,
        VertexInput::Basic,
        true,
        false,
        true,
    ));
    table.push(PipelineDesc::new(
        PipelineKey::base(P::TexWarp),
        "raster tex warp",
        "tex_warp",
        "tex_warp",
        LayoutId::Basic,
        PassTarget::Warp,
        VertexInput::Basic,
        false,
        false,
        false,
    ));

    // Effects and models
    table.push(PipelineDesc::new(
        PipelineKey::base(P::Particle),
        "particles",
        "particle",
        "particle",
        LayoutId::Basic,
        PassTarget::Main,
        VertexInput::Basic,
        true,
        false,
        true,
    ));
    table.push(PipelineDesc::new(
        PipelineKey::base(P::Sprite),
        "sprites",
        "sprite",
        "sprite",
        LayoutId::Basic,
        PassTarget::Main,
        VertexInput::Basic,
        true,
        true,
        false,
    ));

    // Sky styles are mutually exclusive
    table.push(PipelineDesc::new(
        PipelineKey::base(P::Sky),
        "sky color",
        "sky_color",
        "sky_color",
        LayoutId::Basic,
        PassTarget::Main,
        VertexInput::Basic,
        true,
        true,
        false,
    ));
    table.push(PipelineDesc::new(
        PipelineKey::with(P::Sky, V::SKY_BOX),
        "sky box",
        "sky_box",
        "sky_box",
        LayoutId::Basic,
        PassTarget::Main,
        VertexInput::Basic,
        true,
        true,
        false,
    ));
    table.push(PipelineDesc::new(
        PipelineKey::with(P::Sky, V::SKY_LAYER),
        "sky layer",
        "sky_layer",
        "sky_layer",
        LayoutId::SkyLayer,
        PassTarget::Main,
        VertexInput::Basic,
        true,
        true,
        false,
    ));

    table.push(
        PipelineDesc::new(
            PipelineKey::base(P::Alias),
            "alias",
            "alias",
            "alias",
            LayoutId::Alias,
            PassTarget::Main,
            VertexInput::Alias,
            true,
            true,
            false,
        )
        .culled(),
    );
    table.push(
        PipelineDesc::new(
            PipelineKey::with(P::Alias, V::ALPHA_BLEND),
            "alias blend",
            "alias",
            "alias",
            LayoutId::Alias,
            PassTarget::Main,
            VertexInput::Alias,
            true,
            false,
            true,
        )
        .culled(),
    );
    table.push(
        PipelineDesc::new(
            PipelineKey::with(P::Alias, V::ALPHA_TEST),
            "alias alphatest",
            "alias",
            "alias_alphatest",
            LayoutId::Alias,
            PassTarget::Main,
            VertexInput::Alias,
            true,
            true,
            false,
        )
        .culled(),
    );

    // Post-process chain
    table.push(PipelineDesc::new(
        PipelineKey::base(P::Postprocess),
        "postprocess",
        "postprocess",
        "postprocess",
        LayoutId::Postprocess,
        PassTarget::Ui,
        VertexInput::None,
        false,
        false,
        false,
    ));
    table.push(PipelineDesc::new(
        PipelineKey::base(P::ScreenWarp),
        "screen warp",
        "screen_warp",
        "screen_warp",
        LayoutId::ScreenWarp,
        PassTarget::Ui,
        VertexInput::None,
        false,
        false,
        false,
    ));
    table.push(PipelineDesc::new(
        PipelineKey::base(P::Grade),
        "color grade",
        "grade",
        "grade",
        LayoutId::Grade,
        PassTarget::Ui,
        VertexInput::None,
        false,
        false,
        false,
    ));
    table.push(PipelineDesc::new(
        PipelineKey::base(P::Blur),
        "blur",
        "blur",
        "blur",
        LayoutId::Blur,
        PassTarget::Warp,
        VertexInput::None,
        false,
        false,
        false,
    ));

    // Wireframe overlays need line polygon mode
    if non_solid_fill {
        table.push(
            PipelineDesc::new(
                PipelineKey::base(P::ShowTris),
                "showtris",
                "showtris",
                "showtris",
                LayoutId::ShowTris,
                PassTarget::Main,
                VertexInput::Basic,
                false,
                false,
                false,
            )
            .wireframe(),
        );
        table.push(
            PipelineDesc::new(
                PipelineKey::with(P::ShowTris, V::DEPTH_TEST),
                "showtris depth test",
                "showtris",
                "showtris",
                LayoutId::ShowTris,
                PassTarget::Main,
                VertexInput::Basic,
                true,
                false,
                false,
            )
            .wireframe(),
        );
    }

    table
}

/// Named pipeline layouts shared across the catalog
pub struct PipelineLayouts {
    device: Device,
    /// 2D/effect geometry: one texture, matrix + color push constants
    pub basic: vk::PipelineLayout,
    /// World surfaces: diffuse + lightmap + fullbright textures
    pub world: vk::PipelineLayout,
    /// Layered sky: two scrolling cloud textures
    pub sky_layer: vk::PipelineLayout,
    /// Animated models: skin + fullbright + per-draw dynamic uniforms
    pub alias: vk::PipelineLayout,
    /// Scene composite
    pub postprocess: vk::PipelineLayout,
    /// Full-screen warp
    pub screen_warp: vk::PipelineLayout,
    /// Compute texture warp
    pub tex_warp_compute: vk::PipelineLayout,
    /// Wireframe overlay
    pub showtris: vk::PipelineLayout,
    /// Color grading
    pub grade: vk::PipelineLayout,
    /// Separable blur
    pub blur: vk::PipelineLayout,
}

impl PipelineLayouts {
    fn create(
        device: &Device,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_size: u32,
        stages: vk::ShaderStageFlags,
    ) -> VulkanResult<vk::PipelineLayout> {
        let push_constant_ranges = [vk::PushConstantRange {
            stage_flags: stages,
            offset: 0,
            size: push_constant_size,
        }];
        let mut layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(set_layouts);
        if push_constant_size > 0 {
            layout_info = layout_info.push_constant_ranges(&push_constant_ranges);
        }
        unsafe {
            device
                .create_pipeline_layout(&layout_info, None)
                .map_err(VulkanError::Api)
        }
    }

    /// Build every layout against the long-lived set layouts
    pub fn new(device: &Device, sets: &DescriptorLayouts) -> VulkanResult<Self> {
        let gfx = vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT;
        let tex = sets.single_texture.handle();

        let basic = Self::create(device, &[tex], 80, gfx)?;
        let world = Self::create(device, &[tex, tex, tex], 96, gfx)?;
        let sky_layer = Self::create(device, &[tex, tex], 96, gfx)?;
        let alias = Self::create(device, &[tex, tex, sets.dynamic_ubo.handle()], 112, gfx)?;
        let postprocess = Self::create(device, &[tex], 8, vk::ShaderStageFlags::FRAGMENT)?;
        let screen_warp = Self::create(device, &[tex], 16, vk::ShaderStageFlags::FRAGMENT)?;
        let tex_warp_compute = Self::create(
            device,
            &[sets.storage_image.handle()],
            16,
            vk::ShaderStageFlags::COMPUTE,
        )?;
        let showtris = Self::create(device, &[], 64, vk::ShaderStageFlags::VERTEX)?;
        let grade = Self::create(device, &[tex, tex], 16, vk::ShaderStageFlags::FRAGMENT)?;
        let blur = Self::create(device, &[tex], 16, vk::ShaderStageFlags::FRAGMENT)?;

        Ok(Self {
            device: device.clone(),
            basic,
            world,
            sky_layer,
            alias,
            postprocess,
            screen_warp,
            tex_warp_compute,
            showtris,
            grade,
            blur,
        })
    }

    fn get(&self, id: LayoutId) -> vk::PipelineLayout {
        match id {
            LayoutId::Basic => self.basic,
            LayoutId::World => self.world,
            LayoutId::SkyLayer => self.sky_layer,
            LayoutId::Alias => self.alias,
            LayoutId::Postprocess => self.postprocess,
            LayoutId::ScreenWarp => self.screen_warp,
            LayoutId::TexWarpCompute => self.tex_warp_compute,
            LayoutId::ShowTris => self.showtris,
            LayoutId::Grade => self.grade,
            LayoutId::Blur => self.blur,
        }
    }
}

impl Drop for PipelineLayouts {
    fn drop(&mut self) {
        unsafe {
            for layout in [
                self.blur,
                self.grade,
                self.showtris,
                self.tex_warp_compute,
                self.screen_warp,
                self.postprocess,
                self.alias,
                self.sky_layer,
                self.world,
                self.basic,
            ] {
                self.device.destroy_pipeline_layout(layout, None);
            }
        }
    }
}

/// The backend's fixed sampler set
pub struct Samplers {
    device: Device,
    /// Nearest filtering, repeat addressing
    pub point: vk::Sampler,
    /// Linear filtering, repeat addressing
    pub linear: vk::Sampler,
    /// Linear filtering, clamp-to-edge addressing
    pub clamped_linear: vk::Sampler,
    /// Nearest filtering with anisotropy
    pub point_aniso: vk::Sampler,
    /// Linear filtering with anisotropy
    pub linear_aniso: vk::Sampler,
}

impl Samplers {
    /// Create all samplers; anisotropy is capped by the device limit
    pub fn new(ctx: &DeviceContext) -> VulkanResult<Self> {
        let device = ctx.raw_device();
        let aniso_enabled = ctx.physical_device.features.sampler_anisotropy != 0;
        let max_anisotropy = ctx.physical_device.properties.limits.max_sampler_anisotropy;

        let create = |filter: vk::Filter,
                      address: vk::SamplerAddressMode,
                      aniso: bool|
         -> VulkanResult<vk::Sampler> {
            let info = vk::SamplerCreateInfo::builder()
                .mag_filter(filter)
                .min_filter(filter)
                .mipmap_mode(if filter == vk::Filter::LINEAR {
                    vk::SamplerMipmapMode::LINEAR
                } else {
                    vk::SamplerMipmapMode::NEAREST
                })
                .address_mode_u(address)
                .address_mode_v(address)
                .address_mode_w(address)
                .anisotropy_enable(aniso && aniso_enabled)
                .max_anisotropy(if aniso && aniso_enabled {
                    max_anisotropy
                } else {
                    1.0
                })
                .min_lod(0.0)
                .max_lod(vk::LOD_CLAMP_NONE);
            unsafe { device.create_sampler(&info, None).map_err(VulkanError::Api) }
        };

        let point = create(vk::Filter::NEAREST, vk::SamplerAddressMode::REPEAT, false)?;
        let linear = create(vk::Filter::LINEAR, vk::SamplerAddressMode::REPEAT, false)?;
        let clamped_linear = create(
            vk::Filter::LINEAR,
            vk::SamplerAddressMode::CLAMP_TO_EDGE,
            false,
        )?;
        let point_aniso = create(vk::Filter::NEAREST, vk::SamplerAddressMode::REPEAT, true)?;
        let linear_aniso = create(vk::Filter::LINEAR, vk::SamplerAddressMode::REPEAT, true)?;

        Ok(Self {
            device,
            point,
            linear,
            clamped_linear,
            point_aniso,
            linear_aniso,
        })
    }
}

impl Drop for Samplers {
    fn drop(&mut self) {
        unsafe {
            for sampler in [
                self.linear_aniso,
                self.point_aniso,
                self.clamped_linear,
                self.linear,
                self.point,
            ] {
                self.device.destroy_sampler(sampler, None);
            }
        }
    }
}

/// The complete pipeline catalog plus the descriptor machinery it
/// binds
///
/// Field order encodes teardown order: pool and samplers first, then
/// pipeline objects, then pipeline layouts, then set layouts.
pub struct PipelineCatalog {
    scene_color_sets: Vec<vk::DescriptorSet>,
    /// Descriptor pool every backend set is allocated from
    pub descriptor_pool: DescriptorPool,
    /// Fixed sampler set
    pub samplers: Samplers,
    pipelines: HashMap<PipelineKey, Pipeline>,
    /// Named pipeline layouts
    pub layouts: PipelineLayouts,
    /// Long-lived descriptor-set layouts
    pub set_layouts: DescriptorLayouts,
}

impl PipelineCatalog {
    /// Build the full catalog. Any failure unwinds the already-created
    /// objects; the catalog never exists half-constructed.
    pub fn new(
        ctx: &DeviceContext,
        registry: &RenderPassRegistry,
        shader_dir: &Path,
    ) -> VulkanResult<Self> {
        let device = ctx.raw_device();

        let set_layouts = DescriptorLayouts::new(&device)?;
        let layouts = PipelineLayouts::new(&device, &set_layouts)?;

        let table = catalog_table(ctx.non_solid_fill());
        let mut pipelines = HashMap::with_capacity(table.len() + 1);
        let mut shader_cache: HashMap<&'static str, ShaderModule> = HashMap::new();

        for desc in &table {
            let pipeline = Self::create_graphics_pipeline(
                ctx,
                registry,
                &layouts,
                shader_dir,
                &mut shader_cache,
                desc,
            )?;
            ctx.set_object_name(
                vk::Handle::as_raw(pipeline.handle),
                vk::ObjectType::PIPELINE,
                desc.name,
            );
            if pipelines.insert(desc.key, pipeline).is_some() {
                return Err(VulkanError::InvalidOperation {
                    reason: format!("duplicate pipeline key {:?}", desc.key),
                });
            }
        }

        // The compute warp pipeline sits outside the graphics table
        let compute = Self::create_compute_pipeline(
            &device,
            layouts.tex_warp_compute,
            shader_dir,
            "cs_tex_warp",
        )?;
        ctx.set_object_name(
            vk::Handle::as_raw(compute.handle),
            vk::ObjectType::PIPELINE,
            "cs tex warp",
        );
        pipelines.insert(PipelineKey::base(DrawPass::TexWarpCompute), compute);

        let samplers = Samplers::new(ctx)?;

        // Scene-color sets plus headroom for consumer-owned sets
        // (warp chains, color grading LUTs)
        let set_count = (NUM_COLOR_BUFFERS + 6) as u32;
        let descriptor_pool = DescriptorPool::new(device.clone(), set_count)?;

        // Per-slot sets for sampling the scene color target in the
        // post-process chain
        let scene_layouts = vec![set_layouts.single_texture.handle(); NUM_COLOR_BUFFERS];
        let scene_color_sets = descriptor_pool.allocate(&scene_layouts)?;
        for (slot, &set) in scene_color_sets.iter().enumerate() {
            let image_info = vk::DescriptorImageInfo::builder()
                .sampler(samplers.clamped_linear)
                .image_view(registry.scene_color_view(slot))
                .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .build();
            let write = vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(0)
                .dst_array_element(0)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(std::slice::from_ref(&image_info))
                .build();
            unsafe {
                device.update_descriptor_sets(&[write], &[]);
            }
        }

        log::info!("Pipeline catalog built: {} pipelines", pipelines.len());

        Ok(Self {
            scene_color_sets,
            descriptor_pool,
            samplers,
            pipelines,
            layouts,
            set_layouts,
        })
    }

    fn create_graphics_pipeline(
        ctx: &DeviceContext,
        registry: &RenderPassRegistry,
        layouts: &PipelineLayouts,
        shader_dir: &Path,
        shader_cache: &mut HashMap<&'static str, ShaderModule>,
        desc: &PipelineDesc,
    ) -> VulkanResult<Pipeline> {
        let device = ctx.raw_device();

        for stem in [desc.vertex_shader, desc.fragment_shader] {
            if !shader_cache.contains_key(stem) {
                shader_cache.insert(stem, ShaderModule::load(device.clone(), shader_dir, stem)?);
            }
        }
        let shader_stages = [
            shader_cache[desc.vertex_shader].stage_info(vk::ShaderStageFlags::VERTEX),
            shader_cache[desc.fragment_shader].stage_info(vk::ShaderStageFlags::FRAGMENT),
        ];

        let (binding_descriptions, attribute_descriptions) = match desc.vertex_input {
            VertexInput::Basic => (
                vec![BasicVertex::binding_description()],
                BasicVertex::attribute_descriptions().to_vec(),
            ),
            VertexInput::World => (
                vec![WorldVertex::binding_description()],
                WorldVertex::attribute_descriptions().to_vec(),
            ),
            VertexInput::Alias => (
                vec![AliasVertex::binding_description()],
                AliasVertex::attribute_descriptions().to_vec(),
            ),
            VertexInput::None => (vec![], vec![]),
        };
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&binding_descriptions)
            .vertex_attribute_descriptions(&attribute_descriptions);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(if desc.line_mode {
                vk::PolygonMode::LINE
            } else {
                vk::PolygonMode::FILL
            })
            .line_width(1.0)
            .cull_mode(if desc.cull_back {
                vk::CullModeFlags::BACK
            } else {
                vk::CullModeFlags::NONE
            })
            .front_face(vk::FrontFace::CLOCKWISE)
            .depth_bias_enable(false);

        let samples = match desc.target {
            PassTarget::Main => ctx.sample_count(),
            PassTarget::Ui | PassTarget::Warp => vk::SampleCountFlags::TYPE_1,
        };
        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(samples);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(desc.depth_test)
            .depth_write_enable(desc.depth_write)
            .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let color_blend_attachment = if desc.blend {
            vk::PipelineColorBlendAttachmentState::builder()
                .color_write_mask(vk::ColorComponentFlags::RGBA)
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
                .alpha_blend_op(vk::BlendOp::ADD)
                .build()
        } else {
            vk::PipelineColorBlendAttachmentState::builder()
                .color_write_mask(vk::ColorComponentFlags::RGBA)
                .blend_enable(false)
                .build()
        };
        let color_blend_attachments = [color_blend_attachment];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let render_pass = match desc.target {
            PassTarget::Main => registry.main_render_pass(),
            PassTarget::Ui => registry.ui_render_pass(),
            PassTarget::Warp => registry.warp_render_pass(),
        };
        let layout = layouts.get(desc.layout);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(render_pass)
            .subpass(0);

        let pipelines = unsafe {
            device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info.build()], None)
                .map_err(|(_, err)| VulkanError::Api(err))?
        };

        Ok(Pipeline {
            device,
            handle: pipelines[0],
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            layout,
        })
    }

    fn create_compute_pipeline(
        device: &Device,
        layout: vk::PipelineLayout,
        shader_dir: &Path,
        stem: &str,
    ) -> VulkanResult<Pipeline> {
        let shader = ShaderModule::load(device.clone(), shader_dir, stem)?;
        let stage = shader.stage_info(vk::ShaderStageFlags::COMPUTE);

        let pipeline_info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage)
            .layout(layout);

        let pipelines = unsafe {
            device
                .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info.build()], None)
                .map_err(|(_, err)| VulkanError::Api(err))?
        };

        Ok(Pipeline {
            device: device.clone(),
            handle: pipelines[0],
            bind_point: vk::PipelineBindPoint::COMPUTE,
            layout,
        })
    }

    /// Look up a pipeline by key
    pub fn get(&self, key: PipelineKey) -> Option<&Pipeline> {
        self.pipelines.get(&key)
    }

    /// World-surface variant lookup; `variant` carries only the world
    /// family bits
    pub fn world(&self, variant: VariantFlags) -> Option<&Pipeline> {
        self.pipelines.get(&PipelineKey::with(DrawPass::World, variant))
    }

    /// Number of pipelines in the catalog
    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    /// Whether the catalog is empty (it never is after construction)
    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    /// Descriptor set sampling a slot's scene color target
    pub fn scene_color_set(&self, slot: usize) -> vk::DescriptorSet {
        self.scene_color_sets[slot]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_keys_are_unique() {
        let table = catalog_table(true);
        let mut seen = std::collections::HashSet::new();
        for desc in &table {
            assert!(seen.insert(desc.key), "duplicate key {:?}", desc.key);
        }
    }

    #[test]
    fn world_family_has_all_variants() {
        let table = catalog_table(true);
        let world: Vec<_> = table
            .iter()
            .filter(|d| d.key.pass == DrawPass::World)
            .collect();
        assert_eq!(world.len(), WORLD_PIPELINE_COUNT);
        for bits in 0..WORLD_PIPELINE_COUNT as u32 {
            let variant = VariantFlags::from_bits_truncate(bits);
            assert!(world.iter().any(|d| d.key.variant == variant));
        }
    }

    #[test]
    fn blended_variants_never_write_depth() {
        for desc in catalog_table(true) {
            if desc.blend && desc.depth_test {
                assert!(
                    !desc.depth_write,
                    "{} blends but writes depth",
                    desc.name
                );
            }
        }
    }

    #[test]
    fn wireframe_pipelines_require_non_solid_fill() {
        let without = catalog_table(false);
        assert!(without
            .iter()
            .all(|d| d.key.pass != DrawPass::ShowTris && !d.line_mode));

        let with = catalog_table(true);
        assert_eq!(
            with.iter()
                .filter(|d| d.key.pass == DrawPass::ShowTris)
                .count(),
            2
        );
    }

    #[test]
    fn fullscreen_passes_have_no_vertex_input() {
        for desc in catalog_table(true) {
            if matches!(
                desc.key.pass,
                DrawPass::Postprocess | DrawPass::ScreenWarp | DrawPass::Grade | DrawPass::Blur
            ) {
                assert_eq!(desc.vertex_input, VertexInput::None, "{}", desc.name);
                assert!(!desc.depth_test);
            }
        }
    }

    #[test]
    fn alias_family_binds_the_dynamic_ubo_layout() {
        for desc in catalog_table(true) {
            if desc.key.pass == DrawPass::Alias {
                assert_eq!(desc.layout, LayoutId::Alias);
            }
        }
    }

    #[test]
    fn expected_catalog_size() {
        // 8 world + 4 basic + 2 water + 1 tex warp + 1 particle +
        // 1 sprite + 3 sky + 3 alias + 4 post-process chain = 27
        // graphics entries before the wireframe pair
        assert_eq!(catalog_table(false).len(), 27);
        assert_eq!(catalog_table(true).len(), 29);
    }
}
