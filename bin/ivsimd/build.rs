//! ---
//! ivsim_section: "01-core-functionality"
//! ivsim_subsection: "binary"
//! ivsim_type: "source"
//! ivsim_scope: "code"
//! ivsim_description: "Build script stamping version metadata into the simulator binary."
//! ivsim_version: "v0.1.0"
//! ivsim_owner: "tbd"
//! ---
use vergen::EmitBuilder;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Source tarballs carry no git metadata; vergen then emits placeholders.
    EmitBuilder::builder().all_cargo().all_git().emit()?;
    println!("cargo:rerun-if-changed=build.rs");
    Ok(())
}
