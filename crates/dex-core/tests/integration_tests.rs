//! End-to-end flows across the engine: local registry resolution,
//! pack/extract round-trips, HTTP install, and publishing.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use dex_core::cache::Cache;
use dex_core::error::Error;
use dex_core::index::{REGISTRY_INDEX, RegistryIndex};
use dex_core::io::extract::{ExtractError, extract_tarball};
use dex_core::io::pack::{PackOptions, pack};
use dex_core::naming::parse_tarball_filename;
use dex_core::version::Version;
use dex_core::{publish, registry};
use dex_core::registry::SourceMode;
use tempfile::tempdir;

fn write_registry_fixture(root: &Path) {
    fs::write(
        root.join(REGISTRY_INDEX),
        r#"{
  "name": "r",
  "version": "1.0",
  "packages": {
    "p": { "versions": ["1.0.0", "1.1.0", "2.0.0"], "latest": "2.0.0" }
  }
}
"#,
    )
    .unwrap();
    let pkg = root.join("p");
    fs::create_dir(&pkg).unwrap();
    fs::write(pkg.join("plugin.toml"), "name = \"p\"\nversion = \"2.0.0\"\n").unwrap();
    fs::write(pkg.join("entry.txt"), b"payload").unwrap();
}

/// Relative path -> contents for every regular file under `root`.
fn file_tree(root: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut tree = BTreeMap::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir).unwrap() {
            let entry = entry.unwrap();
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.is_file() {
                let rel = path
                    .strip_prefix(root)
                    .unwrap()
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                tree.insert(rel, fs::read(&path).unwrap());
            }
        }
    }
    tree
}

#[tokio::test]
async fn local_registry_round_trip() {
    let dir = tempdir().unwrap();
    write_registry_fixture(dir.path());

    let cache = Cache::with_root(dir.path().join("cache"));
    let reg = registry::open(
        &format!("file:{}", dir.path().display()),
        SourceMode::Auto,
        cache,
    )
    .await
    .unwrap();
    assert_eq!(reg.protocol(), "file");

    let resolved = reg.resolve("p", "^1.0.0").await.unwrap();
    assert_eq!(resolved.version, "1.1.0");

    let fetched = reg
        .fetch(&resolved, &dir.path().join("unused"))
        .await
        .unwrap();
    assert!(fetched.join("entry.txt").is_file());

    let mut names = reg.list_packages().await.unwrap();
    names.sort();
    assert_eq!(names, vec!["p"]);
}

#[test]
fn semver_prerelease_ordering() {
    assert!(Version::parse("1.0.0-alpha").unwrap() < Version::parse("1.0.0").unwrap());
    assert!(Version::parse("1.0.0-alpha.1").unwrap() > Version::parse("1.0.0-alpha").unwrap());
}

#[test]
fn tarball_naming_with_prerelease_and_build() {
    let info = parse_tarball_filename("my-plugin-v2.3.4-beta.1+build.9.tar.gz").unwrap();
    assert_eq!(info.name, "my-plugin");
    assert_eq!(info.version, "2.3.4-beta.1+build.9");
}

#[test]
fn cache_key_stability() {
    use sha2::{Digest, Sha256};
    let url = "s3://b/plugin-1.0.0.tar.gz";
    let expected = format!("s3/{}.tar.gz", hex::encode(Sha256::digest(url.as_bytes())));
    assert_eq!(Cache::url_key("s3", url), expected);
}

#[tokio::test]
async fn publish_then_republish() {
    let dir = tempdir().unwrap();
    let registry_dir = dir.path().join("registry");
    let publisher = publish::open(&format!("file:{}", registry_dir.display()))
        .await
        .unwrap();

    let first = dir.path().join("p-1.0.0.tar.gz");
    fs::write(&first, b"first-bytes").unwrap();
    let result = publisher.publish(&first).await.unwrap();
    assert_eq!(result.name, "p");
    assert_eq!(result.version, "1.0.0");

    let index = RegistryIndex::load(&registry_dir.join(REGISTRY_INDEX)).unwrap();
    assert_eq!(index.packages["p"].versions, vec!["1.0.0"]);
    assert_eq!(index.packages["p"].latest, "1.0.0");

    let second = dir.path().join("p-1.1.0.tar.gz");
    fs::write(&second, b"second-bytes").unwrap();
    publisher.publish(&second).await.unwrap();

    let index = RegistryIndex::load(&registry_dir.join(REGISTRY_INDEX)).unwrap();
    assert_eq!(index.packages["p"].versions, vec!["1.0.0", "1.1.0"]);
    assert_eq!(index.packages["p"].latest, "1.1.0");
}

#[test]
fn path_traversal_refused() {
    use flate2::Compression;
    use flate2::write::GzEncoder;

    let dir = tempdir().unwrap();
    let archive = dir.path().join("evil.tar.gz");
    {
        let file = fs::File::create(&archive).unwrap();
        let enc = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(enc);
        let data = b"gotcha";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        let name = b"../evil.txt";
        header.as_mut_bytes()[..name.len()].copy_from_slice(name);
        header.set_cksum();
        builder.append(&header, &data[..]).unwrap();
        builder.into_inner().unwrap().finish().unwrap();
    }

    let out = dir.path().join("out");
    let err = extract_tarball(&archive, &out).unwrap_err();
    assert!(matches!(err, ExtractError::InvalidTarballPath(_)));
    assert!(!dir.path().join("evil.txt").exists());
    assert!(!out.join("evil.txt").exists());
}

#[test]
fn archive_round_trip_preserves_tree() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("plugin");
    fs::create_dir_all(src.join("lib/nested")).unwrap();
    fs::write(src.join("plugin.toml"), "name = \"rt\"\nversion = \"0.1.0\"\n").unwrap();
    fs::write(src.join("lib/a.txt"), b"alpha").unwrap();
    fs::write(src.join("lib/nested/b.txt"), b"beta").unwrap();
    // Excluded by default and expected to disappear.
    fs::create_dir(src.join(".git")).unwrap();
    fs::write(src.join(".git/config"), b"x").unwrap();
    fs::write(src.join("lib/junk.pyc"), b"x").unwrap();

    let output = dir.path().join("rt-0.1.0.tar.gz");
    let result = pack(
        &src,
        &PackOptions {
            output: Some(output.clone()),
            exclude: None,
        },
    )
    .unwrap();
    assert_eq!(result.name, "rt");

    let out = dir.path().join("out");
    let extracted = extract_tarball(&output, &out).unwrap();
    assert_eq!(extracted, out.join("rt-0.1.0"));

    let mut expected = file_tree(&src);
    expected.remove(".git/config");
    expected.remove("lib/junk.pyc");
    assert_eq!(file_tree(&extracted), expected);
}

#[tokio::test]
async fn http_install_flow_end_to_end() {
    let dir = tempdir().unwrap();

    // Build a real plugin tarball with the packer.
    let src = dir.path().join("demo");
    fs::create_dir_all(src.join("bin")).unwrap();
    fs::write(src.join("plugin.toml"), "name = \"demo\"\nversion = \"1.1.0\"\n").unwrap();
    fs::write(src.join("bin/run.txt"), b"run me").unwrap();
    let tarball = dir.path().join("demo-1.1.0.tar.gz");
    let packed = pack(
        &src,
        &PackOptions {
            output: Some(tarball.clone()),
            exclude: None,
        },
    )
    .unwrap();

    // Serve index and tarball over HTTP.
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/registry.json")
        .with_status(200)
        .with_body(
            r#"{"name":"r","version":"1.0","packages":{"demo":{"versions":["1.0.0","1.1.0"],"latest":"1.1.0"}}}"#,
        )
        .create_async()
        .await;
    server
        .mock("HEAD", "/demo-1.1.0.tar.gz")
        .with_status(200)
        .create_async()
        .await;
    let tarball_mock = server
        .mock("GET", "/demo-1.1.0.tar.gz")
        .with_status(200)
        .with_body(fs::read(&tarball).unwrap())
        .expect(1)
        .create_async()
        .await;

    let cache_root = dir.path().join("cache");
    let reg = registry::open(
        &server.url(),
        SourceMode::Registry,
        Cache::with_root(cache_root.clone()),
    )
    .await
    .unwrap();

    let mut resolved = reg.resolve("demo", "^1.0.0").await.unwrap();
    assert_eq!(resolved.version, "1.1.0");
    assert_eq!(resolved.url, format!("{}/demo-1.1.0.tar.gz", server.url()));

    // Verify against the packer-reported integrity (hex SRI).
    resolved.integrity = Some(packed.integrity.clone());

    let out = dir.path().join("out");
    let extracted = reg.fetch(&resolved, &out).await.unwrap();
    assert_eq!(extracted, out.join("demo-1.1.0"));
    assert_eq!(fs::read(extracted.join("bin/run.txt")).unwrap(), b"run me");

    // Cached under https/<sha256(url)>.tar.gz; a refetch stays offline.
    let key = Cache::url_key("https", &resolved.url);
    assert!(cache_root.join(&key).is_file());
    let again = reg.fetch(&resolved, &dir.path().join("out2")).await.unwrap();
    assert!(again.join("plugin.toml").is_file());
    tarball_mock.assert_async().await;
}

#[tokio::test]
async fn http_fetch_integrity_mismatch_cleans_cache() {
    let dir = tempdir().unwrap();

    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/p-1.0.0.tar.gz")
        .with_status(200)
        .with_body(b"not really a tarball".to_vec())
        .create_async()
        .await;

    let cache_root = dir.path().join("cache");
    let reg = registry::open(
        &format!("{}/p-1.0.0.tar.gz", server.url()),
        SourceMode::Auto,
        Cache::with_root(cache_root.clone()),
    )
    .await
    .unwrap();

    let mut resolved = reg.resolve("p", "latest").await.unwrap();
    resolved.integrity = Some("sha256-0000000000000000000000000000000000000000000000000000000000000000".to_string());

    let err = reg.fetch(&resolved, &dir.path().join("out")).await.unwrap_err();
    assert!(matches!(err, Error::Install { .. }));

    let key = Cache::url_key("https", &resolved.url);
    assert!(!cache_root.join(&key).exists());
}

#[tokio::test]
async fn packed_tarball_publishes_and_resolves_locally() {
    let dir = tempdir().unwrap();

    let src = dir.path().join("tool");
    fs::create_dir_all(&src).unwrap();
    fs::write(src.join("plugin.toml"), "name = \"tool\"\nversion = \"2.0.0\"\n").unwrap();
    fs::write(src.join("tool.txt"), b"contents").unwrap();

    let tarball = dir.path().join("tool-2.0.0.tar.gz");
    let packed = pack(
        &src,
        &PackOptions {
            output: Some(tarball.clone()),
            exclude: None,
        },
    )
    .unwrap();

    let registry_dir = dir.path().join("registry");
    let publisher = publish::open(&format!("file:{}", registry_dir.display()))
        .await
        .unwrap();
    let published = publisher.publish(&tarball).await.unwrap();
    assert_eq!(published.integrity, packed.integrity);
    assert!(published.url.starts_with("file:"));

    // The published tarball is itself a valid direct-tarball source.
    let direct = registry::open(
        &format!("file:{}", registry_dir.join("tool-2.0.0.tar.gz").display()),
        SourceMode::Auto,
        Cache::with_root(dir.path().join("cache")),
    )
    .await
    .unwrap();
    let resolved = direct.resolve("tool", "latest").await.unwrap();
    assert_eq!(resolved.version, "2.0.0");

    let out = dir.path().join("out");
    let extracted = direct.fetch(&resolved, &out).await.unwrap();
    assert_eq!(extracted, out.join("tool-2.0.0"));
    assert_eq!(fs::read(extracted.join("tool.txt")).unwrap(), b"contents");
}

#[tokio::test]
async fn https_publisher_is_manual() {
    let dir = tempdir().unwrap();
    let tarball = dir.path().join("p-3.0.0.tar.gz");
    fs::write(&tarball, b"bytes").unwrap();

    let publisher = publish::open("https://plugins.example.com").await.unwrap();
    let result = publisher.publish(&tarball).await.unwrap();
    assert!(result.manual_instructions.is_some());
    assert_eq!(result.url, "https://plugins.example.com/p-3.0.0.tar.gz");
}

#[test]
fn clear_cache_by_transport() {
    let dir = tempdir().unwrap();
    let cache = Cache::with_root(dir.path().join("cache"));
    for transport in ["git", "https", "s3"] {
        cache.ensure_dir(transport).unwrap();
        fs::write(cache.path_for(&format!("{transport}/entry")), b"x").unwrap();
    }

    cache.clear("https").unwrap();
    assert!(!cache.root().join("https").exists());
    assert!(cache.root().join("git").exists());

    cache.clear("").unwrap();
    assert!(!cache.root().exists());
}
