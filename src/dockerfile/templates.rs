//! Dockerfile rendering.
//!
//! One rendered file per service, built from a language-specific copy/install
//! stanza plus common env/port/user/cmd lines. Env vars render in sorted key
//! order so output is deterministic.

use std::collections::HashMap;
use std::fmt::Write;

pub struct TemplateData<'a> {
    pub base_image: &'a str,
    pub port: u16,
    pub env_vars: &'a HashMap<String, String>,
    pub build_command: &'a str,
    pub run_command: &'a str,
}

/// Per-language dependency/copy stanza, between WORKDIR and RUN build.
fn copy_stanza(language: &str) -> &'static str {
    match language {
        "nodejs" => "COPY package*.json ./\nRUN npm ci\nCOPY . .\n",
        "python" => {
            "COPY requirements.txt ./\nRUN pip install --no-cache-dir -r requirements.txt\nCOPY . .\n"
        }
        _ => "COPY . .\n",
    }
}

fn common_tail(out: &mut String, data: &TemplateData<'_>) {
    let _ = writeln!(out, "ENV PORT={}", data.port);
    let mut keys: Vec<&String> = data.env_vars.keys().collect();
    keys.sort();
    for key in keys {
        let _ = writeln!(out, "ENV {}={}", key, data.env_vars[key]);
    }
    let _ = writeln!(out, "EXPOSE {}", data.port);
    let _ = writeln!(out, "USER 1000:1000");
    let _ = writeln!(out, "CMD [\"sh\", \"-c\", \"{}\"]", data.run_command);
}

/// Single-stage image: build and run in the base image.
pub fn render_single_stage(language: &str, data: &TemplateData<'_>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "FROM {}", data.base_image);
    let _ = writeln!(out, "WORKDIR /app");
    out.push_str(copy_stanza(language));
    let _ = writeln!(out, "RUN {}", data.build_command);
    common_tail(&mut out, data);
    out
}

/// Multi-stage image: build in the base image, run from alpine with only the
/// built /app tree and CA certificates.
pub fn render_multi_stage(language: &str, data: &TemplateData<'_>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "FROM {} AS builder", data.base_image);
    let _ = writeln!(out, "WORKDIR /app");
    out.push_str(copy_stanza(language));
    let _ = writeln!(out, "RUN {}", data.build_command);
    let _ = writeln!(out);
    let _ = writeln!(out, "FROM alpine:latest");
    let _ = writeln!(out, "RUN apk --no-cache add ca-certificates");
    let _ = writeln!(out, "WORKDIR /app");
    let _ = writeln!(out, "COPY --from=builder /app /app");
    common_tail(&mut out, data);
    out
}
