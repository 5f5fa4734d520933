use crate::{CompileError, Result, ShaderCompiler, ShaderSource, ShaderStage};
use shaderc::{CompileOptions, Compiler, ShaderKind};

/// GLSL compiler backed by shaderc, targeting Vulkan 1.3 / SPIR-V 1.6.
pub struct ShadercCompiler {
    compiler: Compiler,
    optimize: bool,
}

impl ShadercCompiler {
    pub fn new() -> Result<Self> {
        let compiler = Compiler::new().ok_or_else(|| CompileError::Compilation {
            name: "shaderc".to_string(),
            diagnostics: "failed to create shader compiler".to_string(),
        })?;
        Ok(Self {
            compiler,
            optimize: !cfg!(debug_assertions),
        })
    }

    /// Run the performance optimizer. Resource names survive either way.
    #[must_use]
    pub fn optimize(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self
    }

    fn options(&self) -> Result<CompileOptions<'static>> {
        let mut options = CompileOptions::new().ok_or_else(|| CompileError::Compilation {
            name: "shaderc".to_string(),
            diagnostics: "failed to create compile options".to_string(),
        })?;
        options.set_target_env(
            shaderc::TargetEnv::Vulkan,
            shaderc::EnvVersion::Vulkan1_3 as u32,
        );
        options.set_target_spirv(shaderc::SpirvVersion::V1_6);
        // Without debug info the optimizer strips OpName, and reflection
        // could only name bindings by slot.
        options.set_generate_debug_info();
        if self.optimize {
            options.set_optimization_level(shaderc::OptimizationLevel::Performance);
        }
        Ok(options)
    }
}

const fn kind(stage: ShaderStage) -> ShaderKind {
    match stage {
        ShaderStage::Vertex => ShaderKind::Vertex,
        ShaderStage::Fragment => ShaderKind::Fragment,
        ShaderStage::Compute => ShaderKind::Compute,
        ShaderStage::RayGen => ShaderKind::RayGeneration,
        ShaderStage::Miss => ShaderKind::Miss,
        ShaderStage::ClosestHit => ShaderKind::ClosestHit,
        ShaderStage::AnyHit => ShaderKind::AnyHit,
        ShaderStage::Intersection => ShaderKind::Intersection,
        ShaderStage::Callable => ShaderKind::Callable,
        ShaderStage::Task => ShaderKind::Task,
        ShaderStage::Mesh => ShaderKind::Mesh,
    }
}

impl ShaderCompiler for ShadercCompiler {
    fn compile(&self, source: &ShaderSource, entry_points: &[&str]) -> Result<Vec<Vec<u32>>> {
        let options = self.options()?;

        entry_points
            .iter()
            .map(|entry| {
                let artifact = self
                    .compiler
                    .compile_into_spirv(
                        &source.text,
                        kind(source.stage),
                        &source.name,
                        entry,
                        Some(&options),
                    )
                    .map_err(|e| CompileError::Compilation {
                        name: source.name.clone(),
                        diagnostics: e.to_string(),
                    })?;

                if artifact.get_num_warnings() > 0 {
                    tracing::warn!(
                        "{}: {}",
                        source.name,
                        artifact.get_warning_messages()
                    );
                }

                Ok(artifact.as_binary().to_vec())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAME: u32 = 5;

    fn names(words: &[u32]) -> Vec<String> {
        let mut names = Vec::new();
        let mut i = 5;
        while i < words.len() {
            let count = (words[i] >> 16) as usize;
            if words[i] & 0xFFFF == NAME {
                let bytes: Vec<u8> = words[i + 2..i + count]
                    .iter()
                    .flat_map(|w| w.to_le_bytes())
                    .take_while(|b| *b != 0)
                    .collect();
                names.push(String::from_utf8(bytes).unwrap());
            }
            i += count.max(1);
        }
        names
    }

    #[test]
    fn optimized_output_keeps_resource_names() {
        let source = ShaderSource {
            name: "names.comp".to_string(),
            text: r"#version 460
layout(local_size_x = 1) in;
layout(set = 0, binding = 0) uniform Params { uint scale; } params;
layout(set = 0, binding = 1, std430) buffer Values { uint values[]; };
void main() { values[gl_GlobalInvocationID.x] *= params.scale; }
"
            .to_string(),
            stage: ShaderStage::Compute,
        };

        for optimize in [false, true] {
            let compiler = ShadercCompiler::new().unwrap().optimize(optimize);
            let modules = compiler.compile(&source, &["main"]).unwrap();
            let names = names(&modules[0]);
            assert!(names.iter().any(|n| n == "params"), "optimize={optimize}: {names:?}");
            assert!(names.iter().any(|n| n == "Values"), "optimize={optimize}: {names:?}");
        }
    }
}
