//! Abstraction over the git CLI so [`crate::bead_store::BeadStore`] can be
//! exercised in tests without a real repository. Mirrors the mockable
//! trait-object shape used elsewhere in this lineage for git operations.

use std::path::Path;

/// Runs git commands against a working directory and reports raw output.
/// The store only ever needs `add`, `commit --allow-empty`, `pull --rebase`,
/// and a `HEAD` read, per the non-goals: it is not a general git wrapper.
pub trait GitRunner: Send + Sync {
    fn run_git(&self, dir: &Path, args: &[&str]) -> Result<GitOutput, String>;
}

#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Shells out to the real `git` binary.
pub struct RealGitRunner;

impl GitRunner for RealGitRunner {
    fn run_git(&self, dir: &Path, args: &[&str]) -> Result<GitOutput, String> {
        let output = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|e| e.to_string())?;

        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Stages every path under `rel_paths` and commits with `message`,
/// allowing an empty commit so status-only transitions still record
/// history. Returns the new `HEAD` commit id on success.
pub fn stage_and_commit(
    git: &dyn GitRunner,
    workdir: &Path,
    rel_paths: &[&str],
    message: &str,
) -> Result<String, String> {
    let mut add_args: Vec<&str> = vec!["add"];
    add_args.extend_from_slice(rel_paths);
    let add = git.run_git(workdir, &add_args)?;
    if !add.success {
        return Err(format!("git add failed: {}", add.stderr));
    }

    let commit = git.run_git(workdir, &["commit", "--allow-empty", "-m", message])?;
    if !commit.success {
        return Err(format!("git commit failed: {}", commit.stderr));
    }

    let head = git.run_git(workdir, &["rev-parse", "HEAD"])?;
    if !head.success {
        return Err(format!("git rev-parse HEAD failed: {}", head.stderr));
    }
    Ok(head.stdout.trim().to_string())
}

/// Exposed under `#[cfg(test)]` for this crate's own tests and under the
/// `test-util` feature for downstream crates (`beadkeep-agents`) whose
/// tests need a `BeadStore` backed by a fake `git` binary.
#[cfg(any(test, feature = "test-util"))]
pub mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Records every invocation and always reports success with a fixed
    /// fake commit id, so store tests never touch a real repository.
    pub struct FakeGitRunner {
        pub calls: Mutex<Vec<Vec<String>>>,
        pub fail_next: Mutex<bool>,
    }

    impl FakeGitRunner {
        pub fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_next: Mutex::new(false),
            }
        }

        pub fn fail_next_call(&self) {
            *self.fail_next.lock().unwrap() = true;
        }
    }

    impl GitRunner for FakeGitRunner {
        fn run_git(&self, _dir: &Path, args: &[&str]) -> Result<GitOutput, String> {
            self.calls
                .lock()
                .unwrap()
                .push(args.iter().map(|s| s.to_string()).collect());

            let mut fail = self.fail_next.lock().unwrap();
            if *fail {
                *fail = false;
                return Ok(GitOutput {
                    success: false,
                    stdout: String::new(),
                    stderr: "fake failure".to_string(),
                });
            }

            if args.first() == Some(&"rev-parse") {
                return Ok(GitOutput {
                    success: true,
                    stdout: "deadbeefcafef00d\n".to_string(),
                    stderr: String::new(),
                });
            }

            Ok(GitOutput {
                success: true,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }
}
