//! Dockerfile generation for services that ship without one.
//!
//! Language detection walks the registry in order and picks the first
//! language whose sentinel file exists in the repo; `generic` is the
//! fallback. Generated files land as `Dockerfile.auto` in the build context;
//! the deployer deletes them after the build.

mod templates;

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use templates::TemplateData;

pub const GENERATED_DOCKERFILE: &str = "Dockerfile.auto";

pub struct LanguageSpec {
    pub name: &'static str,
    pub detect_files: &'static [&'static str],
    pub base_image: &'static str,
    pub multi_stage: bool,
}

/// Detection order matters: earlier entries win when a repo matches several.
pub const LANGUAGES: &[LanguageSpec] = &[
    LanguageSpec {
        name: "nodejs",
        detect_files: &["package.json", "package-lock.json"],
        base_image: "node:20-alpine",
        multi_stage: false,
    },
    LanguageSpec {
        name: "golang",
        detect_files: &["go.mod", "go.sum"],
        base_image: "golang:1.23-alpine",
        multi_stage: true,
    },
    LanguageSpec {
        name: "python",
        detect_files: &["requirements.txt", "pyproject.toml"],
        base_image: "python:3.11-slim",
        multi_stage: false,
    },
    LanguageSpec {
        name: "rust",
        detect_files: &["Cargo.toml"],
        base_image: "rust:1.75-slim",
        multi_stage: true,
    },
    LanguageSpec {
        name: "java",
        detect_files: &["pom.xml", "build.gradle"],
        base_image: "eclipse-temurin:21-jre-alpine",
        multi_stage: false,
    },
];

const GENERIC: LanguageSpec = LanguageSpec {
    name: "generic",
    detect_files: &[],
    base_image: "alpine:latest",
    multi_stage: false,
};

fn spec_for(language: &str) -> &'static LanguageSpec {
    LANGUAGES
        .iter()
        .find(|spec| spec.name == language)
        .unwrap_or(&GENERIC)
}

#[derive(Debug, Clone, Default)]
pub struct DockerfileGenerator;

impl DockerfileGenerator {
    pub fn new() -> Self {
        DockerfileGenerator
    }

    /// Detect the language from repository sentinel files; `generic` if none
    /// match.
    pub fn detect_language(&self, repo_path: &Path) -> &'static str {
        for spec in LANGUAGES {
            for file in spec.detect_files {
                if repo_path.join(file).exists() {
                    return spec.name;
                }
            }
        }
        GENERIC.name
    }

    /// Render a Dockerfile for the service.
    ///
    /// `language` may be empty or `auto`, in which case detection runs
    /// against `repo_path`. Both commands are mandatory for generated files.
    #[allow(clippy::too_many_arguments)]
    pub fn generate(
        &self,
        language: &str,
        base_image: &str,
        port: u16,
        env_vars: &HashMap<String, String>,
        build_command: &str,
        run_command: &str,
        repo_path: &Path,
    ) -> Result<String> {
        let language = if language.is_empty() || language == "auto" {
            self.detect_language(repo_path)
        } else {
            language
        };

        if build_command.trim().is_empty() || run_command.trim().is_empty() {
            return Err(Error::DockerfileGeneration(
                "build_command and run_command are required for generated Dockerfiles".to_string(),
            ));
        }

        let spec = spec_for(language);
        let base_image = if base_image.is_empty() {
            spec.base_image
        } else {
            base_image
        };

        let data = TemplateData {
            base_image,
            port,
            env_vars,
            build_command: build_command.trim(),
            run_command: run_command.trim(),
        };

        Ok(if spec.multi_stage {
            templates::render_multi_stage(spec.name, &data)
        } else {
            templates::render_single_stage(spec.name, &data)
        })
    }

    /// Write the generated Dockerfile into the context directory.
    pub fn write(&self, content: &str, context_dir: &Path) -> Result<PathBuf> {
        let path = context_dir.join(GENERATED_DOCKERFILE);
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Look for a committed Dockerfile in the context directory.
    pub fn existing_dockerfile(&self, context_dir: &Path) -> Option<PathBuf> {
        for name in ["Dockerfile", "dockerfile"] {
            let candidate = context_dir.join(name);
            if candidate.exists() {
                return Some(candidate);
            }
        }
        None
    }
}
