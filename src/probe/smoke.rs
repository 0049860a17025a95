//! Functional smoke tests run in a throwaway directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::random;

use crate::platform::env::Environment;
use crate::platform::pal::{CommandRunner, Invocation, RunError};
use crate::registry::{SmokeTest, TemplateContext};

/// Directory removed when dropped.
#[derive(Debug)]
pub struct ScratchDir(PathBuf);

impl ScratchDir {
    /// Create a fresh, uniquely named directory under `base`.
    pub fn create(base: &Path, label: &str) -> io::Result<Self> {
        let pid = std::process::id();
        for _attempt in 0..32 {
            let nonce = random::<u64>();
            let dir = base.join(format!("devstation-{label}-{pid}-{nonce:016x}"));
            match fs::create_dir(&dir) {
                Ok(()) => return Ok(Self(dir)),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
                Err(err) => {
                    return Err(io::Error::new(
                        err.kind(),
                        format!("failed to create scratch dir {}: {err}", dir.display()),
                    ));
                }
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "could not find a free scratch directory name",
        ))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if self.0.exists() {
            let _ = fs::remove_dir_all(&self.0);
        }
    }
}

/// Run `test`; `Err` carries a one-line reason.
pub fn run_smoke(
    test: &SmokeTest,
    runner: &dyn CommandRunner,
    env: &Environment,
    ctx: &TemplateContext,
    timeout: Duration,
) -> Result<(), String> {
    let Some((program, args)) = test.command.split_first() else {
        return Err("smoke test has no command".to_string());
    };
    let scratch = ScratchDir::create(&std::env::temp_dir(), "smoke")
        .map_err(|e| format!("smoke test setup failed: {e}"))?;
    for (name, body) in &test.files {
        fs::write(scratch.path().join(name), ctx.render(body))
            .map_err(|e| format!("smoke test setup failed: {e}"))?;
    }

    let invocation = Invocation::new(
        ctx.resolve(program, env),
        args.iter().map(|a| ctx.render(a)),
    )
    .in_dir(scratch.path())
    .with_timeout(timeout);

    let output = runner.run(&invocation, env).map_err(|e| match e {
        RunError::Timeout { after, .. } => {
            format!("smoke test timed out after {}s", after.as_secs())
        }
        other => format!("smoke test could not run: {other}"),
    })?;
    if !output.success() {
        let tail = output.stderr_tail();
        return Err(match output.code {
            Some(code) if tail.is_empty() => format!("smoke test exited with code {code}"),
            Some(code) => format!("smoke test exited with code {code}: {tail}"),
            None => "smoke test killed by signal".to_string(),
        });
    }
    if let Some(token) = &test.expect_stdout
        && !output.stdout.contains(token.as_str())
    {
        return Err(format!("smoke test output is missing {token:?}"));
    }
    Ok(())
}
