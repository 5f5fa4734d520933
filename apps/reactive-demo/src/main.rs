//! Reactive headless ray query demo
//!
//! Builds two bottom-level acceleration structures, places three instances
//! of them in a top-level structure and traces one ray per pixel from a
//! compute shader. The instances are then animated by rewriting the
//! instance buffer and refitting the top-level structure.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p reactive-demo --features shaderc -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--shader <PATH>`: GLSL compute shader or pre-compiled `.spv` file
//! - `--size <N>`: Width and height of the traced image (default: 256)
//! - `--frames <N>`: Number of refit frames after the first trace (default: 4)
//! - `--ray-pipeline`: Trace with a ray tracing pipeline instead of ray queries
//! - `--validation`: Enable Vulkan validation layers
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod scene;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use reactive_gpu::{
    reflect, Buffer, BufferCreateInfo, BufferUsage, ComputePipeline, ComputePipelineCreateInfo,
    DescriptorSet, DescriptorSetCreateInfo, GpuContext, GpuContextBuilder, GpuTimer, HitGroup,
    MemoryUsage, RayTracingPipeline, RayTracingPipelineCreateInfo, Shader, ShaderCreateInfo,
    ShaderStage,
};
use reactive_rtx::{accel_trace_barrier, AccelContextExt, TopLevelAccel, TopLevelAccelCreateInfo};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::scene::Scene;

const WORKGROUP_SIZE: u32 = 8;

/// Command line options.
struct Options {
    shader: PathBuf,
    size: u32,
    frames: u32,
    ray_pipeline: bool,
    validation: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            shader: Path::new(env!("CARGO_MANIFEST_DIR")).join("shaders/ray_query.comp"),
            size: 256,
            frames: 4,
            ray_pipeline: false,
            validation: cfg!(debug_assertions),
        }
    }
}

impl Options {
    fn from_args() -> Self {
        let mut options = Self::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--shader" => {
                    if let Some(path) = args.get(i + 1) {
                        options.shader = PathBuf::from(path);
                        i += 1;
                    }
                }
                "--size" => {
                    if let Some(v) = args.get(i + 1).and_then(|v| v.parse().ok()) {
                        options.size = v;
                        i += 1;
                    }
                }
                "--frames" => {
                    if let Some(v) = args.get(i + 1).and_then(|v| v.parse().ok()) {
                        options.frames = v;
                        i += 1;
                    }
                }
                "--ray-pipeline" => options.ray_pipeline = true,
                "--validation" => options.validation = true,
                other => tracing::warn!("Ignoring unknown argument '{other}'"),
            }
            i += 1;
        }

        options
    }
}

/// Camera uniforms, laid out as the shader's `Params` block.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct Params {
    inv_view: Mat4,
    inv_proj: Mat4,
    size: u32,
    _pad: [u32; 3],
}

impl Params {
    fn new(size: u32) -> Self {
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.5, 5.0), Vec3::ZERO, Vec3::Y);
        let proj = Mat4::perspective_rh(45f32.to_radians(), 1.0, 0.1, 100.0);
        Self {
            inv_view: view.inverse(),
            inv_proj: proj.inverse(),
            size,
            _pad: [0; 3],
        }
    }
}

fn main() -> ExitCode {
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return ExitCode::SUCCESS;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run(&Options::from_args()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(options: &Options) -> anyhow::Result<()> {
    let ctx = GpuContextBuilder::new()
        .app_name("Reactive Demo")
        .validation(options.validation)
        .ray_tracing(true)
        .build()
        .context("Failed to create GPU context")?;
    info!("{}", ctx.capabilities().summary());

    let scene = Scene::new(&ctx)?;
    let tlas = ctx.create_top_accel(&TopLevelAccelCreateInfo {
        instances: &scene.instances(0.0),
        debug_name: "scene",
        ..Default::default()
    })?;

    let pixels = u64::from(options.size) * u64::from(options.size);
    let hits = ctx.create_buffer(&BufferCreateInfo {
        size: pixels * std::mem::size_of::<u32>() as u64,
        usage: BufferUsage::STORAGE,
        memory: MemoryUsage::Host,
        debug_name: "hits",
        ..Default::default()
    })?;
    let params = ctx.create_buffer(&BufferCreateInfo {
        usage: BufferUsage::UNIFORM,
        memory: MemoryUsage::Host,
        data: Some(bytemuck::bytes_of(&Params::new(options.size))),
        debug_name: "params",
        ..Default::default()
    })?;
    let timer = ctx.create_timer()?;

    let create_set = |shaders: &[&Shader], name: &str| -> anyhow::Result<DescriptorSet> {
        let set = ctx.create_descriptor_set(
            &DescriptorSetCreateInfo::new()
                .shaders(shaders)
                .resources("scene", &[&tlas])?
                .resources("Hits", &[&hits])?
                .resources("params", &[&params])?
                .debug_name(name),
        )?;
        set.update()?;
        Ok(set)
    };

    if options.ray_pipeline {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("shaders");
        let raygen = create_shader(&ctx, &dir.join("trace.rgen"), ShaderStage::RayGen)?;
        let miss = create_shader(&ctx, &dir.join("trace.rmiss"), ShaderStage::Miss)?;
        let hit = create_shader(&ctx, &dir.join("trace.rchit"), ShaderStage::ClosestHit)?;

        let set = create_set(&[&raygen, &miss, &hit], "trace")?;
        let pipeline = ctx.create_ray_tracing_pipeline(&RayTracingPipelineCreateInfo {
            raygen: &raygen,
            miss: &[&miss],
            hit_groups: &[HitGroup::closest_hit(&hit)],
            descriptor_set_layouts: &[set.layout()],
            push_constant_size: 0,
            max_ray_recursion_depth: 1,
            debug_name: "trace",
        })?;

        Tracer {
            ctx: &ctx,
            kernel: Kernel::RayTracing(&pipeline),
            set: &set,
            timer: &timer,
            hits: &hits,
            size: options.size,
        }
        .run(&scene, &tlas, options.frames)?;
    } else {
        let shader = create_shader(&ctx, &options.shader, ShaderStage::Compute)?;
        let set = create_set(&[&shader], "ray query")?;
        let pipeline = ctx.create_compute_pipeline(&ComputePipelineCreateInfo {
            shader: &shader,
            descriptor_set_layouts: &[set.layout()],
            push_constant_size: 0,
            debug_name: "ray query",
        })?;

        Tracer {
            ctx: &ctx,
            kernel: Kernel::Compute(&pipeline),
            set: &set,
            timer: &timer,
            hits: &hits,
            size: options.size,
        }
        .run(&scene, &tlas, options.frames)?;
    }

    ctx.wait_idle()?;
    Ok(())
}

/// Load a shader, log its reflected bindings and create the module.
fn create_shader(ctx: &GpuContext, path: &Path, stage: ShaderStage) -> anyhow::Result<Shader> {
    let code = load_shader(path)?;
    for binding in reflect(&code)? {
        info!(
            "Shader binding '{}': set {} slot {} {:?} x{}",
            binding.name, binding.set, binding.binding, binding.kind, binding.count
        );
    }
    let name = path.file_name().map_or_else(String::new, |n| n.to_string_lossy().into_owned());
    Ok(ctx.create_shader(&ShaderCreateInfo {
        code: &code,
        stage,
        debug_name: &name,
    })?)
}

/// How rays are launched.
#[derive(Clone, Copy)]
enum Kernel<'a> {
    /// One compute invocation per pixel using ray queries.
    Compute(&'a ComputePipeline),
    RayTracing(&'a RayTracingPipeline),
}

/// Everything needed to trace one image.
struct Tracer<'a> {
    ctx: &'a GpuContext,
    kernel: Kernel<'a>,
    set: &'a DescriptorSet,
    timer: &'a GpuTimer,
    hits: &'a Buffer,
    size: u32,
}

impl Tracer<'_> {
    /// Trace the initial scene, then animate it for `frames` refit frames.
    fn run(&self, scene: &Scene, tlas: &TopLevelAccel, frames: u32) -> anyhow::Result<()> {
        self.trace(tlas, false)?;
        for frame in 1..=frames {
            let angle = frame as f32 * 0.25;
            tlas.update_instances(&scene.instances(angle))?;
            self.trace(tlas, true)?;
        }
        Ok(())
    }

    /// Optionally refit `tlas`, then trace and log per-instance coverage.
    fn trace(&self, tlas: &TopLevelAccel, refit: bool) -> anyhow::Result<()> {
        self.ctx.one_time_submit(|cmd| {
            if refit {
                tlas.refit(cmd)?;
            }
            accel_trace_barrier(cmd);

            self.timer.start(cmd);
            match self.kernel {
                Kernel::Compute(pipeline) => {
                    let groups = self.size.div_ceil(WORKGROUP_SIZE);
                    cmd.bind_pipeline(pipeline);
                    cmd.bind_descriptor_set(self.set, pipeline);
                    cmd.dispatch(groups, groups, 1);
                }
                Kernel::RayTracing(pipeline) => {
                    cmd.bind_pipeline(pipeline);
                    cmd.bind_descriptor_set(self.set, pipeline);
                    cmd.trace_rays(pipeline, self.size, self.size, 1)?;
                }
            }
            self.timer.stop(cmd);

            cmd.memory_barrier(
                vk::PipelineStageFlags2::COMPUTE_SHADER
                    | vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
                vk::AccessFlags2::SHADER_WRITE,
                vk::PipelineStageFlags2::HOST,
                vk::AccessFlags2::HOST_READ,
            );
            Ok(())
        })?;

        let pixels = self.size as usize * self.size as usize;
        let hits: Vec<u32> = self.hits.read(0, pixels)?;
        let mut coverage = [0usize; 4];
        for hit in hits {
            if let Some(count) = coverage.get_mut(hit as usize) {
                *count += 1;
            }
        }

        info!(
            "Traced {}x{} in {:.3} ms: miss {}, instances {:?}",
            self.size,
            self.size,
            self.timer.elapsed_ms()?,
            coverage[0],
            &coverage[1..]
        );
        Ok(())
    }
}

/// Load SPIR-V directly or compile GLSL, caching the result next to the source.
fn load_shader(path: &Path) -> anyhow::Result<Vec<u32>> {
    if path.extension().is_some_and(|ext| ext == "spv") {
        return reactive_shaders::load_spirv(path)
            .with_context(|| format!("Failed to load {}", path.display()));
    }

    let cached = path.with_extension(
        path.extension()
            .map_or_else(|| "spv".to_string(), |ext| format!("{}.spv", ext.to_string_lossy())),
    );
    if !reactive_shaders::needs_recompile(path, &cached)? {
        info!("Using cached {}", cached.display());
        return Ok(reactive_shaders::load_spirv(&cached)?);
    }

    let code = compile_glsl(path)?;
    if let Err(e) = std::fs::write(&cached, bytemuck::cast_slice::<u32, u8>(&code)) {
        tracing::warn!("Failed to cache {}: {e}", cached.display());
    }
    Ok(code)
}

#[cfg(feature = "shaderc")]
fn compile_glsl(path: &Path) -> anyhow::Result<Vec<u32>> {
    use reactive_shaders::{ShaderCompiler, ShaderSource, ShadercCompiler};

    let source = ShaderSource::from_file(path)?;
    let mut modules = ShadercCompiler::new()?.compile(&source, &["main"])?;
    modules
        .pop()
        .with_context(|| format!("No SPIR-V produced for {}", path.display()))
}

#[cfg(not(feature = "shaderc"))]
fn compile_glsl(path: &Path) -> anyhow::Result<Vec<u32>> {
    anyhow::bail!(
        "{} needs compiling; rebuild with `--features shaderc` or pass a .spv file",
        path.display()
    )
}

fn print_help() {
    eprintln!(
        "Reactive headless ray query demo

USAGE:
    cargo run -p reactive-demo --features shaderc -- [OPTIONS]

OPTIONS:
    --shader <PATH>   GLSL compute shader or pre-compiled .spv file
                      Default: shaders/ray_query.comp
    --size <N>        Width and height of the traced image (default: 256)
    --frames <N>      Refit frames after the first trace (default: 4)
    --ray-pipeline    Trace with a ray tracing pipeline instead of ray queries
    --validation      Enable Vulkan validation layers
    -h, --help        Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG          Set log level (e.g., info, debug, trace)"
    );
}
