use std::path::Path;
use std::process::Command;
use walkdir::WalkDir;

fn main() {
    let shader_dir = Path::new("assets/shaders");

    if !shader_dir.exists() {
        std::fs::create_dir_all(shader_dir).expect("Failed to create assets/shaders directory");
    }

    // Recompile when any shader source or this script changes.
    println!("cargo:rerun-if-changed=assets/shaders/");
    println!("cargo:rerun-if-changed=build.rs");

    // The renderer reads SPIR-V from disk at startup, so a machine without glslc
    // can still build the binary and run it against prebuilt .spv files.
    if Command::new("glslc").arg("--version").output().is_err() {
        println!(
            "cargo:warning=glslc not found in PATH; skipping shader compilation for {:?}",
            shader_dir
        );
        return;
    }

    for entry in WalkDir::new(shader_dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        let source_path = entry.path();
        let Some(extension) = source_path.extension().and_then(|s| s.to_str()) else {
            continue;
        };
        if extension != "vert" && extension != "frag" {
            continue;
        }

        let source_filename = source_path
            .file_name()
            .and_then(|name| name.to_str())
            .expect("Shader source filename is not valid UTF-8");
        let output_path = shader_dir.join(format!("{}.spv", source_filename));

        let status = Command::new("glslc")
            .arg(source_path)
            .arg("-o")
            .arg(&output_path)
            .status();

        match status {
            Ok(status) if status.success() => {
                println!(
                    "cargo:warning=Compiled shader {:?} -> {:?}",
                    source_path, output_path
                );
            }
            Ok(status) => panic!(
                "Failed to compile shader {:?}. glslc exited with code: {:?}",
                source_path,
                status.code()
            ),
            Err(e) => panic!(
                "Failed to execute glslc for shader {:?}. Error: {}",
                source_path, e
            ),
        }
    }
}
