//! Thin wrappers around external tool invocations.
use std::ffi::OsStr;
use std::io::Write;
use std::process::{Command, Stdio};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunError {
    #[error("failed to spawn {program:?}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("{command} exited with status {status:?}: {stderr}")]
    Failed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = RunError> = core::result::Result<T, E>;

/// Build a command from a program and its arguments.
pub fn cmd<I, S>(program: &str, args: I) -> Command
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd
}

fn describe(cmd: &Command) -> String {
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|s| s.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Run to completion, capturing stdout. Stderr is folded into the error on failure.
pub fn capture(cmd: &mut Command, input: Option<&[u8]>) -> Result<Vec<u8>> {
    log::debug!("running {}", describe(cmd));
    cmd.stdin(if input.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|source| RunError::Spawn {
        program: cmd.get_program().to_string_lossy().into_owned(),
        source,
    })?;
    if let (Some(mut stdin), Some(input)) = (child.stdin.take(), input) {
        stdin.write_all(input)?;
    }
    let out = child.wait_with_output()?;
    if out.status.success() {
        Ok(out.stdout)
    } else {
        Err(RunError::Failed {
            command: describe(cmd),
            status: out.status.code(),
            stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        })
    }
}

pub fn run(cmd: &mut Command) -> Result<()> {
    capture(cmd, None).map(|_| ())
}

pub fn run_with_stdin(cmd: &mut Command, input: &[u8]) -> Result<()> {
    capture(cmd, Some(input)).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    #[test]
    fn captures_stdout() -> Result<()> {
        let out = capture(&mut cmd("echo", ["hello"]), None)?;
        assert_eq!(out, b"hello\n");
        Ok(())
    }

    #[test]
    fn feeds_stdin() -> Result<()> {
        let out = capture(&mut cmd("cat", Vec::<&str>::new()), Some(b"abc"))?;
        assert_eq!(out, b"abc");
        Ok(())
    }

    #[test]
    fn reports_failure_with_stderr() {
        let err = run(&mut cmd("sh", ["-c", "echo boom >&2; exit 3"])).unwrap_err();
        match err {
            RunError::Failed { status, stderr, .. } => {
                assert_eq!(status, Some(3));
                assert_eq!(stderr, "boom");
            }
            e => panic!("unexpected error {e}"),
        }
    }

    #[test]
    fn reports_missing_program() {
        let err = run(&mut cmd("definitely-not-a-real-program", ["x"])).unwrap_err();
        assert!(matches!(err, RunError::Spawn { .. }));
    }
}
