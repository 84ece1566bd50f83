//! Integration tests for the strata CLI

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    /// Isolated config, state and cache directories for one test
    struct Sandbox {
        dir: TempDir,
    }

    impl Sandbox {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let tier = dir.path().join("tier");
            fs::write(
                dir.path().join("config.toml"),
                format!(
                    "[general]\naudit_log = false\n\n[cache]\ndisk_dir = {:?}\n",
                    tier.to_string_lossy()
                ),
            )
            .unwrap();
            Self { dir }
        }

        fn path(&self) -> &Path {
            self.dir.path()
        }

        fn config_path(&self) -> PathBuf {
            self.path().join("config.toml")
        }

        fn write(&self, name: &str, content: &str) -> PathBuf {
            let path = self.path().join(name);
            fs::write(&path, content).unwrap();
            path
        }

        fn strata(&self) -> Command {
            let mut cmd = cargo_bin_cmd!("strata");
            cmd.env("STRATA_CONFIG", self.config_path())
                .env("XDG_STATE_HOME", self.path().join("state"))
                .env("XDG_CACHE_HOME", self.path().join("cache"))
                .env("USER", "alice")
                .current_dir(self.path());
            cmd
        }
    }

    #[test]
    fn help_displays() {
        Sandbox::new()
            .strata()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("warm sandbox pools"));
    }

    #[test]
    fn version_displays() {
        Sandbox::new()
            .strata()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("strata"));
    }

    #[test]
    fn config_path_follows_env() {
        let sandbox = Sandbox::new();
        sandbox
            .strata()
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        Sandbox::new()
            .strata()
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[general]"))
            .stdout(predicate::str::contains("[pool.default]"));
    }

    #[test]
    fn config_set_persists() {
        let sandbox = Sandbox::new();
        sandbox
            .strata()
            .args(["config", "set", "cache.claim_timeout_ms", "5000"])
            .assert()
            .success();

        sandbox
            .strata()
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("claim_timeout_ms = 5000"));
    }

    #[test]
    fn config_set_rejects_unknown_key() {
        Sandbox::new()
            .strata()
            .args(["config", "set", "cache.bogus", "1"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("unknown configuration key"));
    }

    #[test]
    fn invalid_config_is_reported_with_hint() {
        let sandbox = Sandbox::new();
        sandbox.write("config.toml", "[pool.default]\nmin_size = 9\nmax_size = 2\n");
        sandbox
            .strata()
            .args(["pool", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("pool.default"))
            .stderr(predicate::str::contains("Hint:"));
    }

    #[test]
    fn key_is_deterministic() {
        let sandbox = Sandbox::new();
        sandbox.write("Cargo.lock", "version = 3\n");

        let first = sandbox.strata().arg("key").assert().success();
        let first = String::from_utf8(first.get_output().stdout.clone()).unwrap();
        assert!(predicate::str::is_match(r"^global/[0-9a-f]{64}\n$")
            .unwrap()
            .eval(&first));

        sandbox
            .strata()
            .arg("key")
            .assert()
            .success()
            .stdout(first.clone());

        sandbox.write("Cargo.lock", "version = 4\n");
        let changed = sandbox.strata().arg("key").assert().success();
        assert_ne!(changed.get_output().stdout, first.as_bytes());
    }

    #[test]
    fn key_in_owner_namespace() {
        let sandbox = Sandbox::new();
        sandbox.write("build.sh", "make all\n");
        sandbox
            .strata()
            .args(["key", "build.sh", "--owner", "alice"])
            .assert()
            .success()
            .stdout(predicate::str::starts_with("owner/alice/"));
    }

    #[test]
    fn key_without_inputs_fails() {
        Sandbox::new()
            .strata()
            .arg("key")
            .assert()
            .failure()
            .stderr(predicate::str::contains("no lockfiles"));
    }

    #[test]
    fn classify_env_file_as_owner() {
        let sandbox = Sandbox::new();
        sandbox.write(".env", "API_KEY=abc\n");
        sandbox.write("react.tgz", "package contents");

        sandbox
            .strata()
            .args(["classify", ".env", "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::contains("owner\t.env"));

        sandbox
            .strata()
            .args(["classify", "react.tgz", "--distributable", "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::contains("global\treact.tgz"));
    }

    #[test]
    fn cache_put_get_roundtrip() {
        let sandbox = Sandbox::new();
        sandbox.write("react.tgz", "react-18.2.0");

        sandbox
            .strata()
            .args(["cache", "put", "pkg/react/18.2.0", "react.tgz", "--distributable"])
            .assert()
            .success();

        sandbox
            .strata()
            .args(["cache", "get", "pkg/react/18.2.0"])
            .assert()
            .success()
            .stdout("react-18.2.0");
    }

    #[test]
    fn cache_refuses_sensitive_file_globally() {
        let sandbox = Sandbox::new();
        sandbox.write(".env", "API_KEY=abc\n");

        sandbox
            .strata()
            .args(["cache", "put", "project/env", ".env"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("sensitive"))
            .stderr(predicate::str::contains("--owner"));

        sandbox
            .strata()
            .args(["cache", "list", "--format", "plain"])
            .assert()
            .success()
            .stdout("");
    }

    #[test]
    fn cache_miss_is_not_available() {
        Sandbox::new()
            .strata()
            .args(["cache", "get", "pkg/missing/1.0.0"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Cache entry not available"));
    }

    #[test]
    fn owner_entries_stay_out_of_global() {
        let sandbox = Sandbox::new();
        sandbox.write("notes.txt", "mine");
        sandbox
            .strata()
            .args(["cache", "put", "notes", "notes.txt", "--owner", "alice"])
            .assert()
            .success();

        sandbox
            .strata()
            .args(["cache", "get", "notes", "--owner", "alice"])
            .assert()
            .success()
            .stdout("mine");

        sandbox
            .strata()
            .args(["cache", "get", "notes"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Cache entry not available"));
    }

    #[test]
    fn cache_list_and_purge() {
        let sandbox = Sandbox::new();
        sandbox.write("a.tgz", "a");
        sandbox
            .strata()
            .args(["cache", "put", "pkg/a/1", "a.tgz", "--distributable"])
            .assert()
            .success();

        sandbox
            .strata()
            .args(["cache", "list", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"scope\": \"global\""));

        sandbox
            .strata()
            .args(["cache", "purge", "--yes"])
            .assert()
            .success();

        sandbox
            .strata()
            .args(["cache", "list", "--format", "plain"])
            .assert()
            .success()
            .stdout("");
    }

    #[test]
    fn pool_show_lists_default() {
        Sandbox::new()
            .strata()
            .args(["pool", "show", "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::contains("(default)"));
    }
}
