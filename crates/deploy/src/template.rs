//! Minimal text-template renderer for build assets.
//!
//! Supported actions:
//! - `{{ .Field }}` / `{{ .Nested.Field }}`: a value from the current scope.
//! - `{{ $.Field }}`: a value from the top-level data, usable inside a range.
//! - `{{ range .List }} ... {{ end }}`: repeat the body with each element as scope.
//!
//! Data is any `Serialize` value; strings render raw, other scalars via their JSON text.
//! A reference to a missing field is an error rather than an empty string.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;

/// Substring a template file name must contain; it is stripped from the output name.
pub const TEMPLATE_MARKER: &str = "_tmpl";

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Field(String),
    Range { path: String, body: Vec<Node> },
}

fn parse(src: &str) -> Result<Vec<Node>> {
    // Stack of open range blocks; the bottom frame is the document itself.
    let mut stack: Vec<(Option<String>, Vec<Node>)> = vec![(None, Vec::new())];
    let mut rest = src;

    while let Some(start) = rest.find("{{") {
        let (text, tail) = rest.split_at(start);
        if !text.is_empty() {
            push(&mut stack, Node::Text(text.to_string()));
        }
        let end = tail
            .find("}}")
            .context("unterminated template action, missing `}}`")?;
        let action = tail[2..end].trim();
        rest = &tail[end + 2..];

        if let Some(path) = action.strip_prefix("range ") {
            stack.push((Some(path.trim().to_string()), Vec::new()));
        } else if action == "end" {
            let (path, body) = stack.pop().context("`{{ end }}` without open range")?;
            let path = path.context("`{{ end }}` without open range")?;
            push(&mut stack, Node::Range { path, body });
        } else if action.starts_with('.') || action.starts_with('$') {
            push(&mut stack, Node::Field(action.to_string()));
        } else {
            anyhow::bail!("unsupported template action `{{{{ {action} }}}}`");
        }
    }
    if !rest.is_empty() {
        push(&mut stack, Node::Text(rest.to_string()));
    }

    match stack.pop() {
        Some((None, nodes)) if stack.is_empty() => Ok(nodes),
        _ => anyhow::bail!("unclosed `{{{{ range }}}}` block"),
    }
}

fn push(stack: &mut [(Option<String>, Vec<Node>)], node: Node) {
    if let Some((_, nodes)) = stack.last_mut() {
        nodes.push(node);
    }
}

fn lookup<'a>(path: &str, scope: &'a Value, root: &'a Value) -> Result<&'a Value> {
    let (base, rest) = if let Some(rest) = path.strip_prefix('$') {
        (root, rest)
    } else {
        (scope, path)
    };

    rest.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(base, |value, segment| {
            value
                .get(segment)
                .with_context(|| format!("template field `{path}` not found"))
        })
}

fn emit(nodes: &[Node], scope: &Value, root: &Value, out: &mut String) -> Result<()> {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Field(path) => match lookup(path, scope, root)? {
                Value::String(s) => out.push_str(s),
                Value::Null => {}
                other => out.push_str(&other.to_string()),
            },
            Node::Range { path, body } => {
                let items = lookup(path, scope, root)?
                    .as_array()
                    .with_context(|| format!("template range `{path}` is not a list"))?;
                for item in items {
                    emit(body, item, root, out)?;
                }
            }
        }
    }
    Ok(())
}

/// Render a template held in memory.
pub fn render_str<T: Serialize>(template: &str, data: &T) -> Result<String> {
    let root = serde_json::to_value(data).context("Failed to serialize template data")?;
    let nodes = parse(template)?;
    let mut out = String::with_capacity(template.len());
    emit(&nodes, &root, &root, &mut out)?;
    Ok(out)
}

/// Output file name for a template file name, or `None` if it is not a template.
pub fn output_name(template_name: &str) -> Option<String> {
    template_name
        .contains(TEMPLATE_MARKER)
        .then(|| template_name.replace(TEMPLATE_MARKER, ""))
}

/// Render `template_path` into `dest_dir`, naming the output after the template with the
/// marker removed. The output keeps the template's permissions so scripts stay executable.
pub fn render<T: Serialize>(template_path: &Path, dest_dir: &Path, data: &T) -> Result<PathBuf> {
    let file_name = template_path
        .file_name()
        .and_then(|n| n.to_str())
        .context(format!("Invalid template path {}", template_path.display()))?;
    let out_name = output_name(file_name).context(format!(
        "Template name must contain {TEMPLATE_MARKER}: {file_name}"
    ))?;

    let source = std::fs::read_to_string(template_path)
        .context(format!("Failed to read template {}", template_path.display()))?;
    let rendered = render_str(&source, data)
        .context(format!("Failed to render template {}", template_path.display()))?;

    let dest = dest_dir.join(out_name);
    std::fs::write(&dest, rendered).context(format!("Failed to write {}", dest.display()))?;
    let permissions = std::fs::metadata(template_path)
        .context(format!("Failed to get metadata for {}", template_path.display()))?
        .permissions();
    std::fs::set_permissions(&dest, permissions)
        .context(format!("Failed to set permissions on {}", dest.display()))?;

    tracing::debug!(template = %template_path.display(), dest = %dest.display(), "Rendered template");
    Ok(dest)
}

/// Render every template file of `src_dir` into `dest_dir`; other files are copied as is.
///
/// Returns the written paths in file-name order.
pub fn render_dir<T: Serialize>(src_dir: &Path, dest_dir: &Path, data: &T) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(src_dir)
        .context(format!("Failed to read template directory {}", src_dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    files.sort();

    std::fs::create_dir_all(dest_dir)
        .context(format!("Failed to create {}", dest_dir.display()))?;

    let mut written = Vec::with_capacity(files.len());
    for file in files {
        let name = file.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if name.contains(TEMPLATE_MARKER) {
            written.push(render(&file, dest_dir, data)?);
        } else {
            let dest = dest_dir.join(name);
            std::fs::copy(&file, &dest)
                .context(format!("Failed to copy {} to {}", file.display(), dest.display()))?;
            written.push(dest);
        }
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempdir::TempDir;

    #[test]
    fn test_fields_and_nesting() {
        let data = json!({"Version": "v1.2", "Ports": {"Http": 9000}, "Enabled": true});
        let out = render_str(
            "FROM base:{{.Version}} port={{ .Ports.Http }} on={{ .Enabled }}",
            &data,
        )
        .unwrap();
        assert_eq!(out, "FROM base:v1.2 port=9000 on=true");
    }

    #[test]
    fn test_range_with_root_access() {
        let data = json!({
            "ChainName": "chain-a",
            "Instances": [{"ServiceName": "chain-a-0-node", "L2HttpPort": 9000},
                          {"ServiceName": "chain-a-1-node", "L2HttpPort": 9003}]
        });
        let out = render_str(
            "{{range .Instances}}{{.ServiceName}}@{{.L2HttpPort}}/{{$.ChainName}};{{end}}",
            &data,
        )
        .unwrap();
        assert_eq!(out, "chain-a-0-node@9000/chain-a;chain-a-1-node@9003/chain-a;");
    }

    #[test]
    fn test_unknown_field_is_error() {
        let err = render_str("{{ .Missing }}", &json!({"Present": 1})).unwrap_err();
        assert!(err.to_string().contains("Missing"));
    }

    #[test]
    fn test_malformed_templates() {
        let data = json!({"Items": []});
        assert!(render_str("{{ .Items ", &data).is_err());
        assert!(render_str("{{ range .Items }}", &data).is_err());
        assert!(render_str("{{ end }}", &data).is_err());
        assert!(render_str("{{ if .Items }}", &data).is_err());
    }

    #[test]
    fn test_output_name_strips_marker() {
        assert_eq!(output_name("init_l2_geth_tmpl.sh").as_deref(), Some("init_l2_geth.sh"));
        assert_eq!(output_name("Dockerfile_prod_tmpl").as_deref(), Some("Dockerfile_prod"));
        assert_eq!(output_name("docker-compose.yaml"), None);
    }

    #[test]
    fn test_render_requires_marker() {
        let temp_dir = TempDir::new("rollbake-test").expect("Failed to create temp dir");
        let plain = temp_dir.path().join("Dockerfile");
        std::fs::write(&plain, "FROM x").unwrap();
        assert!(render(&plain, temp_dir.path(), &json!({})).is_err());
    }

    #[test]
    fn test_render_dir() {
        let src = TempDir::new("rollbake-src").expect("Failed to create temp dir");
        let dest = TempDir::new("rollbake-dest").expect("Failed to create temp dir");
        std::fs::write(src.path().join("run_tmpl.sh"), "echo {{ .ChainId }}").unwrap();
        std::fs::write(src.path().join("static.txt"), "{{ untouched }}").unwrap();

        let written = render_dir(src.path(), &dest.path().join("out"), &json!({"ChainId": 7})).unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(
            std::fs::read_to_string(dest.path().join("out/run.sh")).unwrap(),
            "echo 7"
        );
        assert_eq!(
            std::fs::read_to_string(dest.path().join("out/static.txt")).unwrap(),
            "{{ untouched }}"
        );
    }
}
