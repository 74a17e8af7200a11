//! Shared fixtures for pourbrew tests.
//!
//! - bottle tarballs laid out like real bottles (`<name>/<version>/bin/<name>`)
//! - formula JSON as served by the formula API
//! - a throwaway on-disk prefix plus a mock server to serve both

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use flate2::Compression;
use flate2::write::GzEncoder;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::api::ApiClient;
use crate::download::sha256_hex;
use crate::prefix::Prefix;
use crate::traits::ReqwestHttpClient;

/// Bottle tag for the current platform.
pub fn platform_bottle_tag() -> &'static str {
    pb_core::platform_tags().first().copied().unwrap_or("all")
}

/// A gzip-compressed tarball containing `files`.
pub fn gzip_tarball(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, name, *content)
            .expect("append tar entry");
    }
    let raw = builder.into_inner().expect("finish tar");

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&raw).expect("gzip tar");
    encoder.finish().expect("finish gzip")
}

/// A bottle for `name` at `version` with a single executable.
pub fn bottle_tarball(name: &str, version: &str) -> Vec<u8> {
    let exe = format!("{name}/{version}/bin/{name}");
    let script = format!("#!/bin/sh\necho {name} {version}\n");
    gzip_tarball(&[(exe.as_str(), script.as_bytes())])
}

#[derive(Debug, Clone, Default)]
pub struct FormulaFixture<'a> {
    pub name: &'a str,
    pub version: &'a str,
    pub deps: &'a [&'a str],
    pub conflicts_with: &'a [&'a str],
    pub keg_only: bool,
    /// `(resource name, sha256)`; served from `/resources/<name>`.
    pub resources: &'a [(&'a str, &'a str)],
}

/// Formula JSON whose bottle is served from `<base_url>/bottles/<name>-<version>.tar.gz`.
pub fn formula_json(fixture: &FormulaFixture<'_>, base_url: &str, bottle_sha: &str) -> String {
    let tag = platform_bottle_tag();
    let FormulaFixture {
        name,
        version,
        deps,
        conflicts_with,
        keg_only,
        resources,
    } = fixture;

    let resources: Vec<serde_json::Value> = resources
        .iter()
        .map(|(res, sha)| {
            serde_json::json!({
                "name": res,
                "url": format!("{base_url}/resources/{res}"),
                "sha256": sha,
            })
        })
        .collect();

    serde_json::json!({
        "name": name,
        "versions": { "stable": version },
        "dependencies": deps,
        "conflicts_with": conflicts_with,
        "keg_only": keg_only,
        "bottle": {
            "stable": {
                "rebuild": 0,
                "files": {
                    tag: {
                        "url": format!("{base_url}/bottles/{name}-{version}.tar.gz"),
                        "sha256": bottle_sha,
                    }
                }
            }
        },
        "resources": resources,
    })
    .to_string()
}

/// A temporary root and prefix, plus a mock server for the formula API and bottles.
pub struct TestContext {
    pub tmp: TempDir,
    pub server: MockServer,
    pub prefix: Arc<Prefix>,
}

impl TestContext {
    pub async fn new() -> Self {
        let tmp = TempDir::new().expect("tempdir");
        let server = MockServer::start().await;
        let prefix = Prefix::open(&tmp.path().join("root"), &tmp.path().join("prefix"))
            .expect("open test prefix");
        Self {
            tmp,
            server,
            prefix: Arc::new(prefix),
        }
    }

    pub fn api(&self) -> ApiClient {
        ApiClient::with_http(
            format!("{}/formula", self.server.uri()),
            Arc::new(ReqwestHttpClient::new()),
        )
    }

    pub fn prefix_dir(&self) -> PathBuf {
        self.tmp.path().join("prefix")
    }

    /// Serve formula JSON and its bottle. Returns the bottle's sha256.
    pub async fn mount_formula(&self, fixture: &FormulaFixture<'_>) -> String {
        let bottle = bottle_tarball(fixture.name, fixture.version);
        let sha = sha256_hex(&bottle);

        Mock::given(method("GET"))
            .and(path(format!("/formula/{}.json", fixture.name)))
            .respond_with(ResponseTemplate::new(200).set_body_string(formula_json(
                fixture,
                &self.server.uri(),
                &sha,
            )))
            .mount(&self.server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!(
                "/bottles/{}-{}.tar.gz",
                fixture.name, fixture.version
            )))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(bottle))
            .mount(&self.server)
            .await;

        sha
    }

    /// Serve `body` at `/resources/<name>`. Returns its sha256.
    pub async fn mount_resource(&self, name: &str, body: &[u8]) -> String {
        Mock::given(method("GET"))
            .and(path(format!("/resources/{name}")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
            .mount(&self.server)
            .await;
        sha256_hex(body)
    }
}
