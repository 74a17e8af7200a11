use crate::{Error, Formula};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedBottle {
    pub tag: String,
    pub url: String,
    pub sha256: String,
}

/// Bottle tags for the running platform, most preferred first.
pub fn platform_tags() -> &'static [&'static str] {
    #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
    {
        &[
            "arm64_tahoe",
            "arm64_sequoia",
            "arm64_sonoma",
            "arm64_ventura",
        ]
    }

    #[cfg(all(target_os = "macos", target_arch = "x86_64"))]
    {
        &["sonoma", "ventura", "monterey", "big_sur"]
    }

    #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
    {
        &["arm64_linux"]
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    {
        &["x86_64_linux"]
    }

    #[cfg(not(any(
        all(target_os = "macos", target_arch = "aarch64"),
        all(target_os = "macos", target_arch = "x86_64"),
        all(target_os = "linux", target_arch = "aarch64"),
        all(target_os = "linux", target_arch = "x86_64"),
    )))]
    {
        &[]
    }
}

/// Same OS and arch family, but a release we don't list explicitly.
fn is_same_family(tag: &str) -> bool {
    #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
    {
        tag.starts_with("arm64_") && !tag.ends_with("_linux")
    }

    #[cfg(all(target_os = "macos", target_arch = "x86_64"))]
    {
        !tag.starts_with("arm64_") && !tag.ends_with("_linux") && tag != "all"
    }

    #[cfg(target_os = "linux")]
    {
        platform_tags().contains(&tag)
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        let _ = tag;
        false
    }
}

pub fn select_bottle(formula: &Formula) -> Result<SelectedBottle, Error> {
    let files = &formula.bottle.stable.files;
    let pick = |tag: &str| {
        files.get(tag).map(|file| SelectedBottle {
            tag: tag.to_string(),
            url: file.url.clone(),
            sha256: file.sha256.clone(),
        })
    };

    if let Some(selected) = platform_tags().iter().find_map(|tag| pick(*tag)) {
        return Ok(selected);
    }

    // Platform-independent bottles, e.g. ca-certificates
    if let Some(selected) = pick("all") {
        return Ok(selected);
    }

    if let Some(tag) = files.keys().find(|tag| is_same_family(tag))
        && let Some(selected) = pick(tag)
    {
        return Ok(selected);
    }

    Err(Error::UnsupportedBottle {
        name: formula.name.clone(),
        available_tags: files.keys().cloned().collect(),
    })
}
