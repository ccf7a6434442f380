//! Platform normalisation and the ranking used to pick entries out of a
//! manifest list.
use anyhow::bail;
use distribution::manifest::{Descriptor, Platform};

/// Normalises the names of a platform so equivalent platforms compare equal.
///
/// Architectures follow Go's naming, so `x86_64` becomes `amd64` and
/// `aarch64` becomes `arm64`. ARM platforms always carry a variant; 64-bit
/// ARM only carries one when it is not the default `v8`.
pub fn normalize(platform: &Platform) -> Platform {
    let mut p = platform.clone();
    p.os = p.os.to_lowercase();
    if p.os == "macos" {
        p.os = "darwin".to_owned();
    }
    let (architecture, variant) = normalize_arch(&p.architecture, &p.variant);
    p.architecture = architecture;
    p.variant = variant;
    p
}

fn normalize_arch(arch: &str, variant: &str) -> (String, String) {
    let arch = arch.to_lowercase();
    let variant = variant.to_lowercase();
    match arch.as_str() {
        "i386" | "x86" => ("386".to_owned(), String::new()),
        "x86_64" | "x86-64" | "amd64" => {
            let variant = if variant == "v1" { String::new() } else { variant };
            ("amd64".to_owned(), variant)
        }
        "aarch64" | "arm64" => {
            let variant = match variant.as_str() {
                "8" | "v8" => String::new(),
                _ => variant,
            };
            ("arm64".to_owned(), variant)
        }
        "armhf" => ("arm".to_owned(), "v7".to_owned()),
        "armel" => ("arm".to_owned(), "v6".to_owned()),
        "arm" => {
            let variant = match variant.as_str() {
                "" | "7" => "v7".to_owned(),
                "5" | "6" | "8" => format!("v{}", variant),
                _ => variant,
            };
            ("arm".to_owned(), variant)
        }
        _ => (arch, variant),
    }
}

/// The platform of the running host.
pub fn default_platform() -> Platform {
    normalize(&Platform {
        os: std::env::consts::OS.to_owned(),
        architecture: std::env::consts::ARCH.to_owned(),
        ..Default::default()
    })
}

/// Parses `os`, `arch`, `os/arch` or `os/arch/variant`.
///
/// A lone component is taken as an operating system when it names one, and
/// as an architecture otherwise; the missing half comes from the host.
pub fn parse(s: &str) -> anyhow::Result<Platform> {
    let parts: Vec<&str> = s.split('/').collect();
    if parts.iter().any(|p| p.is_empty()) {
        bail!("invalid platform {:?}: empty component", s);
    }
    let host = default_platform();
    let platform = match parts.as_slice() {
        [one] => {
            if is_known_os(&one.to_lowercase()) {
                Platform {
                    os: one.to_string(),
                    architecture: host.architecture,
                    variant: host.variant,
                    ..Default::default()
                }
            } else {
                Platform {
                    os: host.os,
                    architecture: one.to_string(),
                    ..Default::default()
                }
            }
        }
        [os, arch] => Platform {
            os: os.to_string(),
            architecture: arch.to_string(),
            ..Default::default()
        },
        [os, arch, variant] => Platform {
            os: os.to_string(),
            architecture: arch.to_string(),
            variant: variant.to_string(),
            ..Default::default()
        },
        _ => bail!("invalid platform {:?}: too many components", s),
    };
    Ok(normalize(&platform))
}

fn is_known_os(os: &str) -> bool {
    matches!(
        os,
        "linux" | "windows" | "darwin" | "macos" | "freebsd" | "netbsd" | "openbsd" | "solaris"
            | "illumos" | "android" | "aix"
    )
}

/// Fills in the host's operating system and architecture when they are
/// missing.
pub fn with_default(platform: &Platform) -> Platform {
    let host = default_platform();
    let mut p = platform.clone();
    if p.os.is_empty() {
        p.os = host.os;
    }
    if p.architecture.is_empty() {
        p.architecture = host.architecture;
        p.variant = host.variant;
    }
    p
}

/// Matches platforms that can run on a target platform, ranking them from
/// the closest to the most distant.
///
/// A platform ranks first when it is the target itself. Older variants
/// follow for ARM, and 32-bit platforms follow their 64-bit counterpart.
#[derive(Clone, Debug)]
pub struct Matcher {
    vector: Vec<Platform>,
}

impl Matcher {
    /// Creates a matcher for the given target.
    pub fn new(target: &Platform) -> Self {
        Matcher {
            vector: platform_vector(normalize(target)),
        }
    }

    /// The rank of a candidate, lower is better. `None` when it cannot run.
    pub fn rank(&self, candidate: &Platform) -> Option<usize> {
        let candidate = normalize(candidate);
        self.vector.iter().position(|p| {
            p.os == candidate.os
                && p.architecture == candidate.architecture
                && p.variant == candidate.variant
        })
    }

    /// Whether a candidate can run on the target.
    pub fn matches(&self, candidate: &Platform) -> bool {
        self.rank(candidate).is_some()
    }
}

fn platform_vector(platform: Platform) -> Vec<Platform> {
    let mut vector = vec![platform.clone()];
    let with_arch = |architecture: &str, variant: String| Platform {
        architecture: architecture.to_owned(),
        variant,
        ..platform.clone()
    };
    match platform.architecture.as_str() {
        "amd64" => {
            if let Some(mut version) = variant_number(&platform.variant) {
                while version > 1 {
                    version -= 1;
                    let variant = if version == 1 {
                        String::new()
                    } else {
                        format!("v{}", version)
                    };
                    vector.push(with_arch("amd64", variant));
                }
            }
            vector.push(with_arch("386", String::new()));
        }
        "arm" => {
            if let Some(mut version) = variant_number(&platform.variant) {
                while version > 5 {
                    version -= 1;
                    vector.push(with_arch("arm", format!("v{}", version)));
                }
            }
        }
        "arm64" => {
            let variant = if platform.variant.is_empty() {
                "v8".to_owned()
            } else {
                platform.variant.clone()
            };
            vector.extend(platform_vector(with_arch("arm", variant)));
        }
        _ => {}
    }
    vector
}

fn variant_number(variant: &str) -> Option<u32> {
    variant.strip_prefix('v').and_then(|n| n.parse().ok())
}

/// Picks the manifest list entries that can run on `platform`, best first.
///
/// Entries without a platform are kept, after every entry that declares one.
/// Entries that rank the same keep their order from the list.
pub fn filter_manifests<'a>(manifests: &'a [Descriptor], platform: &Platform) -> Vec<&'a Descriptor> {
    let matcher = Matcher::new(&with_default(platform));
    let mut matches: Vec<(usize, &Descriptor)> = manifests
        .iter()
        .filter_map(|desc| match &desc.platform {
            Some(p) => matcher.rank(p).map(|rank| (rank, desc)),
            None => Some((usize::MAX, desc)),
        })
        .collect();
    matches.sort_by_key(|(rank, _)| *rank);
    matches.into_iter().map(|(_, desc)| desc).collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    fn platform(os: &str, arch: &str, variant: &str) -> Platform {
        Platform {
            os: os.to_owned(),
            architecture: arch.to_owned(),
            variant: variant.to_owned(),
            ..Default::default()
        }
    }

    fn entry(digest_byte: u8, p: Option<Platform>) -> Descriptor {
        Descriptor {
            media_type: distribution::manifest::IMAGE_MANIFEST_MEDIA_TYPE.to_owned(),
            digest: distribution::Digest::from_bytes(&[digest_byte]).to_string(),
            size: 1,
            platform: p,
            ..Default::default()
        }
    }

    #[rstest(
        arch,
        variant,
        want_arch,
        want_variant,
        case("x86_64", "", "amd64", ""),
        case("aarch64", "", "arm64", ""),
        case("arm64", "v8", "arm64", ""),
        case("armhf", "", "arm", "v7"),
        case("arm", "", "arm", "v7"),
        case("arm", "6", "arm", "v6"),
        case("i386", "", "386", "")
    )]
    fn normalizes_architectures(arch: &str, variant: &str, want_arch: &str, want_variant: &str) {
        let p = normalize(&platform("Linux", arch, variant));
        assert_eq!("linux", p.os);
        assert_eq!(want_arch, p.architecture);
        assert_eq!(want_variant, p.variant);
    }

    #[test]
    fn parses_platform_strings() {
        assert_eq!(platform("linux", "arm", "v7"), parse("linux/arm/v7").unwrap());
        assert_eq!(platform("linux", "amd64", ""), parse("linux/x86_64").unwrap());
        assert_eq!("windows", parse("windows").unwrap().os);
        assert_eq!("arm64", parse("arm64").unwrap().architecture);
        assert!(parse("linux//v7").is_err());
        assert!(parse("a/b/c/d").is_err());
    }

    #[test]
    fn arm_ranks_older_variants_after_the_exact_one() {
        let matcher = Matcher::new(&platform("linux", "arm64", ""));
        assert_eq!(Some(0), matcher.rank(&platform("linux", "aarch64", "")));
        assert!(matcher.rank(&platform("linux", "arm", "v7")) > matcher.rank(&platform("linux", "arm", "v8")));
        assert!(matcher.matches(&platform("linux", "arm", "v5")));
        assert!(!matcher.matches(&platform("linux", "amd64", "")));
        assert!(!matcher.matches(&platform("windows", "arm64", "")));

        let v6 = Matcher::new(&platform("linux", "arm", "v6"));
        assert!(!v6.matches(&platform("linux", "arm", "v7")));
    }

    #[test]
    fn filter_picks_the_requested_platform() {
        let list = vec![
            entry(1, Some(platform("linux", "arm64", ""))),
            entry(2, None),
            entry(3, Some(platform("linux", "386", ""))),
            entry(4, Some(platform("linux", "amd64", ""))),
        ];
        let matches = filter_manifests(&list, &platform("linux", "amd64", ""));
        let digests: Vec<&str> = matches.iter().map(|d| d.digest.as_str()).collect();
        assert_eq!(
            vec![
                list[3].digest.as_str(),
                list[2].digest.as_str(),
                list[1].digest.as_str()
            ],
            digests
        );

        let none = filter_manifests(&list[..1], &platform("linux", "amd64", ""));
        assert!(none.is_empty());
    }
}
