use std::fs;

use anyhow::Result;
use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use credkit_test_utils::wire::https_query;
use credkit_test_utils::{HelperTestEnv, request};
use predicates::prelude::*;
use test_case::test_case;

const TOKEN: &str = "ghp_abc123";

fn helper(env: &HelperTestEnv) -> Command {
  let mut cmd = cargo_bin_cmd!("git-credential-credkit");
  for var in HelperTestEnv::CLEARED_VARS {
    cmd.env_remove(var);
  }
  cmd.envs(env.envs());
  cmd
}

fn store_request(host: &str, token: &str) -> String {
  request(&[
    ("protocol", "https"),
    ("host", host),
    ("username", "PersonalAccessToken"),
    ("password", token),
  ])
}

fn get_response(host: &str, token: &str) -> String {
  store_request(host, token)
}

#[test]
fn store_then_get_returns_the_token() -> Result<()> {
  let env = HelperTestEnv::new();

  helper(&env)
    .arg("store")
    .write_stdin(store_request("github.com", TOKEN))
    .assert()
    .success()
    .stdout("");

  helper(&env)
    .arg("get")
    .write_stdin(https_query("github.com"))
    .assert()
    .success()
    .stdout(get_response("github.com", TOKEN));

  let on_disk = fs::read_to_string(env.store_path())?;
  assert!(!on_disk.contains(TOKEN), "token must not be stored in plaintext");
  Ok(())
}

#[test]
fn get_for_another_host_emits_nothing() {
  let env = HelperTestEnv::new();
  helper(&env)
    .arg("store")
    .write_stdin(store_request("github.com", TOKEN))
    .assert()
    .success();

  helper(&env)
    .arg("get")
    .write_stdin(https_query("gitlab.com"))
    .assert()
    .success()
    .stdout("");
}

#[test]
fn erase_removes_the_token_and_tolerates_absence() {
  let env = HelperTestEnv::new();
  helper(&env)
    .arg("store")
    .write_stdin(store_request("github.com", TOKEN))
    .assert()
    .success();

  for _ in 0..2 {
    helper(&env)
      .arg("erase")
      .write_stdin(https_query("github.com"))
      .assert()
      .success()
      .stdout("");
  }

  helper(&env)
    .arg("get")
    .write_stdin(https_query("github.com"))
    .assert()
    .success()
    .stdout("");
}

#[test_case("protocol=https\nhost=github.com\nusername=PersonalAccessToken\n\n" ; "missing password")]
#[test_case("protocol=https\nhost=github.com\npassword=ghp_abc123\n" ; "missing blank line")]
#[test_case("protocol=https\nghp_abc123\n\n" ; "line without equals")]
fn malformed_store_fails_without_writing(input: &str) {
  let env = HelperTestEnv::new();

  helper(&env)
    .arg("store")
    .write_stdin(input)
    .assert()
    .failure()
    .stdout("")
    .stderr(predicate::str::contains("malformed credential input"))
    .stderr(predicate::str::contains(TOKEN).not());

  assert!(!env.store_path().exists());
}

#[test]
fn unknown_action_is_ignored() {
  let env = HelperTestEnv::new();

  helper(&env)
    .arg("capability")
    .write_stdin(https_query("github.com"))
    .assert()
    .success()
    .stdout("");
}

#[test]
fn environment_fallback_applies_only_when_nothing_is_stored() {
  let env = HelperTestEnv::new();

  helper(&env)
    .env("GITHUB_PAT", "ghp_fromenv")
    .arg("get")
    .write_stdin(https_query("github.com"))
    .assert()
    .success()
    .stdout(get_response("github.com", "ghp_fromenv"));

  helper(&env)
    .env("GITHUB_PAT", "ghp_fromenv")
    .arg("store")
    .write_stdin(store_request("github.com", TOKEN))
    .assert()
    .success();

  helper(&env)
    .env("GITHUB_PAT", "ghp_fromenv")
    .arg("get")
    .write_stdin(https_query("github.com"))
    .assert()
    .success()
    .stdout(get_response("github.com", TOKEN));
}

#[test]
fn corrupt_store_reads_as_empty_and_is_replaced_on_store() -> Result<()> {
  let env = HelperTestEnv::new();
  fs::write(env.store_path(), "{ not json")?;

  helper(&env)
    .arg("get")
    .write_stdin(https_query("github.com"))
    .assert()
    .success()
    .stdout("");

  helper(&env)
    .arg("store")
    .write_stdin(store_request("github.com", TOKEN))
    .assert()
    .success();

  let moved_aside = fs::read_dir(env.temp_dir.path().join("data"))?
    .filter_map(|entry| entry.ok())
    .filter(|entry| entry.file_name().to_string_lossy().starts_with("credentials.enc.corrupt-"))
    .count();
  assert_eq!(moved_aside, 1);
  helper(&env)
    .arg("get")
    .write_stdin(https_query("github.com"))
    .assert()
    .success()
    .stdout(get_response("github.com", TOKEN));
  Ok(())
}

#[test]
fn store_with_another_passphrase_is_refused_and_keeps_tokens() {
  let env = HelperTestEnv::new();
  helper(&env)
    .arg("store")
    .write_stdin(store_request("github.com", TOKEN))
    .assert()
    .success();

  helper(&env)
    .env(HelperTestEnv::PASSPHRASE_ENV, "not the passphrase")
    .arg("store")
    .write_stdin(store_request("gitlab.com", "glpat_other"))
    .assert()
    .failure()
    .stderr(predicate::str::contains("different key"))
    .stderr(predicate::str::contains("glpat_other").not());

  helper(&env)
    .arg("get")
    .write_stdin(https_query("github.com"))
    .assert()
    .success()
    .stdout(get_response("github.com", TOKEN));
}

#[test]
fn verbose_logging_never_shows_the_token() {
  let env = HelperTestEnv::new();

  helper(&env)
    .arg("-vvv")
    .arg("store")
    .write_stdin(store_request("github.com", TOKEN))
    .assert()
    .success()
    .stderr(predicate::str::contains("Stored credential"))
    .stderr(predicate::str::contains(TOKEN).not());

  helper(&env)
    .arg("-vvv")
    .arg("get")
    .write_stdin(https_query("github.com"))
    .assert()
    .success()
    .stderr(predicate::str::contains(TOKEN).not());
}

#[test]
fn invalid_configuration_is_reported() {
  let env = HelperTestEnv::new();
  env.write_config("backend = \"floppy\"\n");

  helper(&env)
    .arg("get")
    .write_stdin(https_query("github.com"))
    .assert()
    .failure()
    .stderr(predicate::str::contains("Failed to load configuration"));
}

#[test]
fn version_includes_build_metadata() {
  let env = HelperTestEnv::new();

  helper(&env)
    .arg("--version")
    .assert()
    .success()
    .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[cfg(unix)]
#[test]
fn cache_backend_launches_daemon_and_forgets_on_erase() {
  let env = HelperTestEnv::with_backend("cache");

  helper(&env)
    .arg("store")
    .write_stdin(store_request("github.com", TOKEN))
    .assert()
    .success();
  assert!(env.socket_path().exists());

  helper(&env)
    .arg("get")
    .write_stdin(https_query("github.com"))
    .assert()
    .success()
    .stdout(get_response("github.com", TOKEN));

  // Emptying the cache stops the daemon
  helper(&env)
    .arg("erase")
    .write_stdin(https_query("github.com"))
    .assert()
    .success();

  helper(&env)
    .arg("get")
    .write_stdin(https_query("github.com"))
    .assert()
    .success()
    .stdout("");
}
