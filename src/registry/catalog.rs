//! Built-in workstation catalog.
//!
//! This table is the single place where default versions, download
//! locations, exports and cleanup targets are declared.

use crate::registry::{
    AmbientRoot, AptRepository, ArchiveFormat, ArchiveSpec, CleanupSpec, Component,
    InstallMethod, LanguageManager, ProbeSpec, ProfileExport, SmokeTest, VersionSpec,
};

/// Token printed by smoke-test programs.
pub const SMOKE_TOKEN: &str = "devstation-smoke-ok";

const BASE_PACKAGES: &[&str] = &[
    "ca-certificates",
    "curl",
    "git",
    "gnupg",
    "build-essential",
    "unzip",
    "jq",
];

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

fn exact(v: &str) -> VersionSpec {
    VersionSpec::Exact(v.to_string())
}

fn probe(command: &[&str], pattern: &str) -> ProbeSpec {
    ProbeSpec {
        locate: None,
        command: strings(command),
        version_pattern: pattern.to_string(),
        smoke: None,
        ambient_root: None,
    }
}

fn archive(url: &str, format: ArchiveFormat, install_root: &str) -> ArchiveSpec {
    ArchiveSpec {
        url: url.to_string(),
        latest_url: None,
        latest_pattern: None,
        format,
        archive_root: None,
        install_root: install_root.to_string(),
        sha256: None,
    }
}

/// Shell check that every package is in dpkg's `installed` state.
fn all_installed_check(packages: &[&str]) -> String {
    format!(
        "for p in {}; do [ \"$(dpkg-query -W -f='${{db:Status-Status}}' \"$p\" 2>/dev/null)\" = installed ] || exit 1; done; echo {SMOKE_TOKEN}",
        packages.join(" ")
    )
}

fn base_packages() -> Component {
    Component {
        name: "base-packages".to_string(),
        description: "Build essentials and download tooling".to_string(),
        required: true,
        enabled: true,
        version: VersionSpec::Latest,
        method: InstallMethod::PackageRepository {
            repository: None,
            packages: strings(BASE_PACKAGES),
        },
        depends_on: Vec::new(),
        exports: Vec::new(),
        owned_paths: Vec::new(),
        probe: ProbeSpec {
            smoke: Some(SmokeTest {
                files: Vec::new(),
                command: vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    all_installed_check(BASE_PACKAGES),
                ],
                expect_stdout: Some(SMOKE_TOKEN.to_string()),
            }),
            ..probe(&["git", "--version"], r"git version (\d+\.\d+\.\d+)")
        },
        cleanup: CleanupSpec::default(),
    }
}

fn go() -> Component {
    Component {
        name: "go".to_string(),
        description: "Go toolchain".to_string(),
        required: true,
        enabled: true,
        version: exact("1.24.0"),
        method: InstallMethod::DownloadArchive(ArchiveSpec {
            latest_url: Some("https://go.dev/VERSION?m=text".to_string()),
            latest_pattern: Some(r"go(\d+\.\d+(?:\.\d+)?)".to_string()),
            archive_root: Some("go".to_string()),
            ..archive(
                "https://go.dev/dl/go{version}.linux-{arch}.tar.gz",
                ArchiveFormat::TarGz,
                "/usr/local/go",
            )
        }),
        depends_on: strings(&["base-packages"]),
        exports: vec![
            ProfileExport::set("GOROOT", "/usr/local/go"),
            ProfileExport::set("GOPATH", "$HOME/go"),
            ProfileExport::PrependPath("$GOROOT/bin".to_string()),
            ProfileExport::PrependPath("$GOPATH/bin".to_string()),
        ],
        owned_paths: strings(&["/usr/local/go"]),
        probe: ProbeSpec {
            locate: Some("/usr/local/go/bin/go".to_string()),
            command: strings(&["/usr/local/go/bin/go", "version"]),
            version_pattern: r"go version go(\d+\.\d+(?:\.\d+)?)".to_string(),
            smoke: Some(SmokeTest {
                files: vec![(
                    "main.go".to_string(),
                    format!(
                        "package main\n\nimport \"fmt\"\n\nfunc main() {{\n\tfmt.Println(\"{SMOKE_TOKEN}\")\n}}\n"
                    ),
                )],
                command: strings(&["/usr/local/go/bin/go", "run", "main.go"]),
                expect_stdout: Some(SMOKE_TOKEN.to_string()),
            }),
            ambient_root: Some(AmbientRoot {
                var: "GOROOT".to_string(),
                expected: "/usr/local/go".to_string(),
            }),
        },
        cleanup: CleanupSpec {
            legacy_paths: strings(&["/usr/lib/go", "/usr/bin/go", "/usr/bin/gofmt"]),
            package_patterns: strings(&["golang", "golang-go", "golang-[0-9]*", "golang-src"]),
            cache_paths: strings(&["$HOME/.cache/go-build"]),
            legacy_profile_lines: strings(&[
                "# Go environment variables",
                "/usr/local/go/bin",
                "export GOROOT=",
                "export GOPATH=",
            ]),
        },
    }
}

fn docker() -> Component {
    Component {
        name: "docker".to_string(),
        description: "Docker engine, CLI and compose plugin".to_string(),
        required: false,
        enabled: true,
        version: VersionSpec::Latest,
        method: InstallMethod::PackageRepository {
            repository: Some(AptRepository {
                name: "docker".to_string(),
                key_url: "https://download.docker.com/linux/{distro}/gpg".to_string(),
                keyring_file: "docker.asc".to_string(),
                uri: "https://download.docker.com/linux/{distro}".to_string(),
                suite: "{codename}".to_string(),
                components: strings(&["stable"]),
            }),
            packages: strings(&[
                "docker-ce",
                "docker-ce-cli",
                "containerd.io",
                "docker-buildx-plugin",
                "docker-compose-plugin",
            ]),
        },
        depends_on: strings(&["base-packages"]),
        exports: Vec::new(),
        owned_paths: Vec::new(),
        probe: probe(&["docker", "--version"], r"Docker version ([0-9.]+)"),
        cleanup: CleanupSpec {
            package_patterns: strings(&[
                "docker.io",
                "docker-doc",
                "docker-compose",
                "docker-compose-v2",
                "podman-docker",
                "containerd",
                "runc",
            ]),
            ..CleanupSpec::default()
        },
    }
}

fn kubectl() -> Component {
    Component {
        name: "kubectl".to_string(),
        description: "Kubernetes command-line client".to_string(),
        required: false,
        enabled: true,
        version: VersionSpec::Latest,
        method: InstallMethod::DownloadArchive(ArchiveSpec {
            latest_url: Some("https://dl.k8s.io/release/stable.txt".to_string()),
            latest_pattern: Some(r"v(\d+\.\d+\.\d+)".to_string()),
            ..archive(
                "https://dl.k8s.io/release/v{version}/bin/linux/{arch}/kubectl",
                ArchiveFormat::Binary,
                "/usr/local/bin/kubectl",
            )
        }),
        depends_on: strings(&["base-packages"]),
        exports: Vec::new(),
        owned_paths: Vec::new(),
        probe: probe(&["kubectl", "version", "--client"], r"Client Version: v?(\S+)"),
        cleanup: CleanupSpec {
            legacy_paths: strings(&["/usr/bin/kubectl"]),
            package_patterns: strings(&["kubectl"]),
            cache_paths: strings(&["$HOME/.kube/cache"]),
            ..CleanupSpec::default()
        },
    }
}

fn helm() -> Component {
    Component {
        name: "helm".to_string(),
        description: "Kubernetes package manager".to_string(),
        required: false,
        enabled: true,
        version: exact("3.16.3"),
        method: InstallMethod::DownloadArchive(ArchiveSpec {
            archive_root: Some("linux-{arch}/helm".to_string()),
            ..archive(
                "https://get.helm.sh/helm-v{version}-linux-{arch}.tar.gz",
                ArchiveFormat::TarGz,
                "/usr/local/bin/helm",
            )
        }),
        depends_on: strings(&["base-packages"]),
        exports: Vec::new(),
        owned_paths: Vec::new(),
        probe: probe(&["helm", "version", "--short"], r"v(\d+\.\d+\.\d+)"),
        cleanup: CleanupSpec {
            cache_paths: strings(&["$HOME/.cache/helm"]),
            ..CleanupSpec::default()
        },
    }
}

fn k9s() -> Component {
    Component {
        name: "k9s".to_string(),
        description: "Terminal UI for Kubernetes clusters".to_string(),
        required: false,
        enabled: true,
        version: exact("0.32.7"),
        method: InstallMethod::DownloadArchive(ArchiveSpec {
            archive_root: Some("k9s".to_string()),
            ..archive(
                "https://github.com/derailed/k9s/releases/download/v{version}/k9s_Linux_{arch}.tar.gz",
                ArchiveFormat::TarGz,
                "/usr/local/bin/k9s",
            )
        }),
        depends_on: strings(&["base-packages"]),
        exports: Vec::new(),
        owned_paths: Vec::new(),
        probe: probe(&["k9s", "version", "-s"], r"Version\s+v?(\d+\.\d+\.\d+)"),
        cleanup: CleanupSpec::default(),
    }
}

fn kind() -> Component {
    Component {
        name: "kind".to_string(),
        description: "Kubernetes in Docker".to_string(),
        required: false,
        enabled: true,
        version: exact("0.25.0"),
        method: InstallMethod::LanguagePackage {
            manager: LanguageManager::Go,
            package: "sigs.k8s.io/kind".to_string(),
        },
        depends_on: strings(&["go", "docker"]),
        exports: Vec::new(),
        owned_paths: strings(&["$HOME/go/bin/kind"]),
        probe: probe(&["kind", "version"], r"kind v(\d+\.\d+\.\d+)"),
        cleanup: CleanupSpec::default(),
    }
}

fn gopls() -> Component {
    Component {
        name: "gopls".to_string(),
        description: "Go language server".to_string(),
        required: false,
        enabled: true,
        version: VersionSpec::Latest,
        method: InstallMethod::LanguagePackage {
            manager: LanguageManager::Go,
            package: "golang.org/x/tools/gopls".to_string(),
        },
        depends_on: strings(&["go"]),
        exports: Vec::new(),
        owned_paths: strings(&["$HOME/go/bin/gopls"]),
        probe: probe(&["gopls", "version"], r"gopls v(\d+\.\d+\.\d+)"),
        cleanup: CleanupSpec::default(),
    }
}

fn golangci_lint() -> Component {
    Component {
        name: "golangci-lint".to_string(),
        description: "Go linters aggregator".to_string(),
        required: false,
        enabled: true,
        version: exact("1.62.2"),
        method: InstallMethod::LanguagePackage {
            manager: LanguageManager::Go,
            package: "github.com/golangci/golangci-lint/cmd/golangci-lint".to_string(),
        },
        depends_on: strings(&["go"]),
        exports: Vec::new(),
        owned_paths: strings(&["$HOME/go/bin/golangci-lint"]),
        probe: probe(&["golangci-lint", "--version"], r"version v?(\d+\.\d+\.\d+)"),
        cleanup: CleanupSpec {
            cache_paths: strings(&["$HOME/.cache/golangci-lint"]),
            ..CleanupSpec::default()
        },
    }
}

fn nvm() -> Component {
    Component {
        name: "nvm".to_string(),
        description: "Node version manager".to_string(),
        required: false,
        enabled: true,
        version: exact("0.40.1"),
        method: InstallMethod::DownloadArchive(ArchiveSpec {
            archive_root: Some("nvm-{version}".to_string()),
            ..archive(
                "https://github.com/nvm-sh/nvm/archive/refs/tags/v{version}.tar.gz",
                ArchiveFormat::TarGz,
                "$HOME/.nvm",
            )
        }),
        depends_on: strings(&["base-packages"]),
        exports: vec![
            ProfileExport::set("NVM_DIR", "$HOME/.nvm"),
            ProfileExport::Raw("[ -s \"$NVM_DIR/nvm.sh\" ] && . \"$NVM_DIR/nvm.sh\"".to_string()),
            ProfileExport::Raw(
                "[ -s \"$NVM_DIR/bash_completion\" ] && . \"$NVM_DIR/bash_completion\""
                    .to_string(),
            ),
        ],
        owned_paths: Vec::new(),
        probe: ProbeSpec {
            locate: Some("$HOME/.nvm/nvm.sh".to_string()),
            command: vec![
                "bash".to_string(),
                "-c".to_string(),
                ". \"$HOME/.nvm/nvm.sh\" && nvm --version".to_string(),
            ],
            version_pattern: r"(\d+\.\d+\.\d+)".to_string(),
            smoke: None,
            ambient_root: None,
        },
        cleanup: CleanupSpec {
            legacy_profile_lines: strings(&["export NVM_DIR=", "$NVM_DIR/nvm.sh", "$NVM_DIR/bash_completion"]),
            ..CleanupSpec::default()
        },
    }
}

fn node() -> Component {
    Component {
        name: "node".to_string(),
        description: "Node.js runtime managed by nvm".to_string(),
        required: false,
        enabled: true,
        version: exact("22.12.0"),
        method: InstallMethod::LanguagePackage {
            manager: LanguageManager::Nvm,
            package: "node".to_string(),
        },
        depends_on: strings(&["nvm"]),
        exports: vec![ProfileExport::PrependPath(
            "$HOME/.nvm/versions/node/v{version}/bin".to_string(),
        )],
        owned_paths: strings(&["$HOME/.nvm/versions/node/v{version}"]),
        probe: ProbeSpec {
            smoke: Some(SmokeTest {
                files: vec![(
                    "smoke.js".to_string(),
                    format!("console.log(\"{SMOKE_TOKEN}\");\n"),
                )],
                command: strings(&["node", "smoke.js"]),
                expect_stdout: Some(SMOKE_TOKEN.to_string()),
            }),
            ..probe(&["node", "--version"], r"v(\d+\.\d+\.\d+)")
        },
        cleanup: CleanupSpec {
            package_patterns: strings(&["nodejs", "libnode[0-9]*"]),
            ..CleanupSpec::default()
        },
    }
}

fn pnpm() -> Component {
    Component {
        name: "pnpm".to_string(),
        description: "pnpm package manager".to_string(),
        required: false,
        enabled: true,
        version: exact("9.15.0"),
        method: InstallMethod::LanguagePackage {
            manager: LanguageManager::Npm,
            package: "pnpm".to_string(),
        },
        depends_on: strings(&["node"]),
        exports: Vec::new(),
        owned_paths: Vec::new(),
        probe: probe(&["pnpm", "--version"], r"(\d+\.\d+\.\d+)"),
        cleanup: CleanupSpec {
            cache_paths: strings(&["$HOME/.cache/pnpm"]),
            ..CleanupSpec::default()
        },
    }
}

fn chrome() -> Component {
    Component {
        name: "chrome".to_string(),
        description: "Google Chrome for browser testing".to_string(),
        required: false,
        enabled: true,
        version: VersionSpec::Latest,
        method: InstallMethod::PackageRepository {
            repository: Some(AptRepository {
                name: "google-chrome".to_string(),
                key_url: "https://dl.google.com/linux/linux_signing_key.pub".to_string(),
                keyring_file: "google-chrome.asc".to_string(),
                uri: "https://dl.google.com/linux/chrome/deb/".to_string(),
                suite: "stable".to_string(),
                components: strings(&["main"]),
            }),
            packages: strings(&["google-chrome-stable"]),
        },
        depends_on: strings(&["base-packages"]),
        exports: Vec::new(),
        owned_paths: Vec::new(),
        probe: probe(&["google-chrome", "--version"], r"Google Chrome ([0-9.]+)"),
        cleanup: CleanupSpec::default(),
    }
}

fn gh() -> Component {
    Component {
        name: "gh".to_string(),
        description: "GitHub CLI".to_string(),
        required: false,
        enabled: true,
        version: VersionSpec::Latest,
        method: InstallMethod::PackageRepository {
            repository: Some(AptRepository {
                name: "github-cli".to_string(),
                key_url: "https://cli.github.com/packages/githubcli-archive-keyring.gpg"
                    .to_string(),
                keyring_file: "githubcli-archive-keyring.gpg".to_string(),
                uri: "https://cli.github.com/packages".to_string(),
                suite: "stable".to_string(),
                components: strings(&["main"]),
            }),
            packages: strings(&["gh"]),
        },
        depends_on: strings(&["base-packages"]),
        exports: Vec::new(),
        owned_paths: Vec::new(),
        probe: probe(&["gh", "--version"], r"gh version (\d+\.\d+\.\d+)"),
        cleanup: CleanupSpec {
            legacy_paths: strings(&["/usr/local/bin/gh"]),
            ..CleanupSpec::default()
        },
    }
}

/// Components in catalog order; the planner breaks ties by this order.
#[must_use]
pub fn builtin_components() -> Vec<Component> {
    vec![
        base_packages(),
        go(),
        docker(),
        kubectl(),
        helm(),
        k9s(),
        kind(),
        gopls(),
        golangci_lint(),
        nvm(),
        node(),
        pnpm(),
        chrome(),
        gh(),
    ]
}
