use std::ffi::OsString;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tfgate_core::{ChangeDocument, LoadError};

pub const DEFAULT_PLAN_FILE: &str = "plan.tfplan";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Runner { Terraform, Tofu }

pub fn pick_runner(prefer: Option<Runner>) -> Result<Runner, LoadError> {
    if let Some(p) = prefer { return Ok(p); }
    if which::which("tofu").is_ok() { Ok(Runner::Tofu) }
    else if which::which("terraform").is_ok() { Ok(Runner::Terraform) }
    else { Err(LoadError::ToolNotFound("neither 'tofu' nor 'terraform' found in PATH".to_string())) }
}

fn bin(r: Runner) -> &'static str { match r { Runner::Terraform => "terraform", Runner::Tofu => "tofu" } }

/// The provisioning binary to drive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tool { program: PathBuf }

impl Tool {
    pub fn runner(r: Runner) -> Self { Self { program: PathBuf::from(bin(r)) } }

    /// An explicit binary, e.g. a pinned terraform outside PATH.
    pub fn at(program: impl Into<PathBuf>) -> Self { Self { program: program.into() } }

    pub fn program(&self) -> &Path { &self.program }

    fn run(&self, stage: &'static str, dir: &Path, args: &[&str]) -> Result<Output, LoadError> {
        let mut chdir = OsString::from("-chdir=");
        chdir.push(dir);
        tracing::debug!(program = %self.program.display(), dir = %dir.display(), ?args, "running {stage}");
        let out = Command::new(&self.program)
            .arg(chdir)
            .args(args)
            .env("TF_IN_AUTOMATION", "1")
            .output()
            .map_err(|source| LoadError::Spawn { stage, source })?;
        if !out.status.success() {
            // terraform reports most errors on stderr, a few only on stdout
            let text = if out.stderr.is_empty() { &out.stdout } else { &out.stderr };
            return Err(LoadError::Tool {
                stage,
                code: out.status.code(),
                stderr: String::from_utf8_lossy(text).trim().to_string(),
            });
        }
        Ok(out)
    }
}

/// `init` with the backend disabled, so no remote state or credentials are needed.
#[tracing::instrument(skip(tool), fields(program = %tool.program.display()))]
pub fn run_init(tool: &Tool, dir: &Path) -> Result<(), LoadError> {
    tool.run("init", dir, &["init", "-backend=false", "-input=false", "-no-color"])?;
    Ok(())
}

/// Writes the plan artifact `plan_file` inside `dir`.
#[tracing::instrument(skip(tool), fields(program = %tool.program.display()))]
pub fn run_plan(tool: &Tool, dir: &Path, plan_file: &str) -> Result<(), LoadError> {
    let out = format!("-out={plan_file}");
    tool.run("plan", dir, &["plan", &out, "-input=false", "-lock=false", "-refresh=false", "-no-color"])?;
    Ok(())
}

/// Renders an existing plan artifact as JSON (stdout bytes only).
#[tracing::instrument(skip(tool), fields(program = %tool.program.display()))]
pub fn show_json(tool: &Tool, dir: &Path, plan_file: &str) -> Result<Vec<u8>, LoadError> {
    let out = tool.run("show", dir, &["show", "-json", "-no-color", plan_file])?;
    tracing::debug!(bytes = out.stdout.len(), "plan rendered");
    Ok(out.stdout)
}

/// init, plan and show in sequence, stopping at the first failing stage.
pub fn load_plan(tool: &Tool, dir: &Path, plan_file: &str) -> Result<ChangeDocument, LoadError> {
    run_init(tool, dir)?;
    run_plan(tool, dir, plan_file)?;
    let bytes = show_json(tool, dir, plan_file)?;
    ChangeDocument::from_slice(&bytes)
}

/// Reads an already rendered plan; `-` means stdin.
pub fn read_plan_json(path: &Path) -> Result<ChangeDocument, LoadError> {
    let read_err = |source: std::io::Error| LoadError::Read { path: path.to_path_buf(), source };
    let bytes = if path == Path::new("-") {
        let mut buf = Vec::new();
        std::io::stdin().lock().read_to_end(&mut buf).map_err(read_err)?;
        buf
    } else {
        std::fs::read(path).map_err(read_err)?
    };
    ChangeDocument::from_slice(&bytes)
}
