use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

/// A reserved `{ip, port}` tuple bound to a server. The primary allocation
/// is published to the container as `SERVER_IP`/`SERVER_PORT`; every
/// allocation is mapped in both TCP and UDP.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Allocation {
    pub ip: String,
    pub port: u16,
}

/// The image-and-command recipe that specializes a server for a particular
/// application.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CoreSpec {
    #[serde(default)]
    pub install_script: String,
    #[serde(default)]
    pub startup_command: String,
    #[serde(default)]
    pub stop_command: String,
    /// File path -> template. A JSON-string template stays JSON; an object
    /// template becomes `key=value` lines.
    #[serde(default)]
    pub config_system: HashMap<String, Value>,
    #[serde(default)]
    pub startup_parser: Value,
}

/// Declarative start spec, provided per action by the panel.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartData {
    /// MiB.
    pub memory: u64,
    /// Percent of one CPU times ten.
    pub cpu: u64,
    /// MiB. Recorded for the runtime; not translated into a storage option.
    pub disk: u64,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    pub primary_allocation: Allocation,
    #[serde(default, rename = "additionalAllocation")]
    pub additional_allocations: Vec<Allocation>,
    pub image: String,
    #[serde(default)]
    pub core: CoreSpec,
}

impl StartData {
    pub fn all_allocations(&self) -> Vec<Allocation> {
        let mut out = vec![self.primary_allocation.clone()];
        out.extend(self.additional_allocations.iter().cloned());
        out
    }

    /// Environment handed to the container, `NAME=value` form.
    pub fn container_env(&self) -> Vec<String> {
        let mut env: Vec<String> = self
            .template_vars()
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        env.sort();
        env
    }

    /// The substitution table: `SERVER_MEMORY`, `SERVER_PORT`, `SERVER_IP`
    /// plus every environment entry.
    pub fn template_vars(&self) -> HashMap<String, String> {
        let mut vars = HashMap::new();
        vars.insert("SERVER_MEMORY".to_string(), self.memory.to_string());
        vars.insert(
            "SERVER_PORT".to_string(),
            self.primary_allocation.port.to_string(),
        );
        vars.insert("SERVER_IP".to_string(), self.primary_allocation.ip.clone());
        for (k, v) in &self.environment {
            vars.insert(k.clone(), v.clone());
        }
        vars
    }
}

/// Everything the start sequence needs after template rendering.
#[derive(Debug, Clone)]
pub struct RenderedStart {
    /// Final shell command for `/bin/sh -c`.
    pub command: String,
    /// Sandbox-relative file path -> file contents.
    pub config_files: Vec<(String, String)>,
    pub startup_parser: Value,
}

fn substitute(input: &str, vars: &HashMap<String, String>) -> String {
    let mut out = input.to_string();
    for (name, value) in vars {
        out = out.replace(&format!("{{{{{name}}}}}"), value);
    }
    out
}

fn render_value(value: &Value, vars: &HashMap<String, String>) -> Value {
    match value {
        Value::String(s) => Value::String(substitute(s, vars)),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, vars)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn render_config_file(template: &Value, vars: &HashMap<String, String>) -> String {
    match template {
        // JSON text keeps JSON: substitute, then reparse and pretty-print
        // when the result still parses.
        Value::String(raw) => {
            let rendered = substitute(raw, vars);
            match serde_json::from_str::<Value>(&rendered) {
                Ok(parsed) => serde_json::to_string_pretty(&parsed).unwrap_or(rendered),
                Err(_) => rendered,
            }
        }
        // Object form becomes key=value lines.
        Value::Object(map) => {
            let mut lines = String::new();
            for (key, value) in map {
                let rendered = render_value(value, vars);
                lines.push_str(&format!("{key}={}\n", scalar_text(&rendered)));
            }
            lines
        }
        other => scalar_text(&render_value(other, vars)),
    }
}

fn render_startup_parser(parser: &Value, vars: &HashMap<String, String>) -> Value {
    if parser.is_null() {
        return Value::Null;
    }
    // The parser may be a JSON-shaped object; render through its serialized
    // text so placeholders inside nested values are covered, then reparse.
    let text = substitute(&parser.to_string(), vars);
    serde_json::from_str(&text).unwrap_or_else(|_| render_value(parser, vars))
}

/// Render the start spec: substitute template variables, materialize config
/// file contents and compose the final container command.
pub fn render(data: &StartData) -> RenderedStart {
    let vars = data.template_vars();

    let install = substitute(&data.core.install_script, &vars);
    let mut startup = substitute(&data.core.startup_command, &vars);
    if !startup.trim_start().starts_with("exec") {
        startup = format!("exec {startup}");
    }

    let command = if install.trim().is_empty() {
        startup
    } else {
        format!("{install}\n{startup}")
    };

    let mut config_files: Vec<(String, String)> = data
        .core
        .config_system
        .iter()
        .map(|(file, template)| (file.clone(), render_config_file(template, &vars)))
        .collect();
    config_files.sort_by(|a, b| a.0.cmp(&b.0));

    RenderedStart {
        command,
        config_files,
        startup_parser: render_startup_parser(&data.core.startup_parser, &vars),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn start_data(core: CoreSpec) -> StartData {
        StartData {
            memory: 2048,
            cpu: 1000,
            disk: 10240,
            environment: HashMap::from([("WORLD".to_string(), "lobby".to_string())]),
            primary_allocation: Allocation {
                ip: "10.0.0.5".to_string(),
                port: 25565,
            },
            additional_allocations: vec![],
            image: "busybox:latest".to_string(),
            core,
        }
    }

    #[test]
    fn variables_cover_server_values_and_environment() {
        let data = start_data(CoreSpec {
            startup_command: "run -m {{SERVER_MEMORY}} -p {{SERVER_PORT}} -h {{SERVER_IP}} -w {{WORLD}}"
                .to_string(),
            ..Default::default()
        });
        let rendered = render(&data);
        assert_eq!(
            rendered.command,
            "exec run -m 2048 -p 25565 -h 10.0.0.5 -w lobby"
        );
    }

    #[test]
    fn startup_is_not_double_prefixed() {
        let data = start_data(CoreSpec {
            startup_command: "exec ./server".to_string(),
            ..Default::default()
        });
        assert_eq!(render(&data).command, "exec ./server");
    }

    #[test]
    fn install_script_runs_ahead_of_startup() {
        let data = start_data(CoreSpec {
            install_script: "wget {{SERVER_IP}}/setup.sh".to_string(),
            startup_command: "./server".to_string(),
            ..Default::default()
        });
        assert_eq!(
            render(&data).command,
            "wget 10.0.0.5/setup.sh\nexec ./server"
        );
    }

    #[test]
    fn json_config_template_is_reparsed_and_pretty_printed() {
        let data = start_data(CoreSpec {
            startup_command: "./server".to_string(),
            config_system: HashMap::from([(
                "settings.json".to_string(),
                json!("{\"port\": \"{{SERVER_PORT}}\"}"),
            )]),
            ..Default::default()
        });
        let rendered = render(&data);
        let (file, contents) = &rendered.config_files[0];
        assert_eq!(file, "settings.json");
        let parsed: Value = serde_json::from_str(contents).unwrap();
        assert_eq!(parsed["port"], "25565");
        // Pretty output spans multiple lines.
        assert!(contents.contains('\n'));
    }

    #[test]
    fn object_config_template_becomes_key_value_lines() {
        let data = start_data(CoreSpec {
            startup_command: "./server".to_string(),
            config_system: HashMap::from([(
                "server.properties".to_string(),
                json!({"server-port": "{{SERVER_PORT}}", "motd": "hello"}),
            )]),
            ..Default::default()
        });
        let rendered = render(&data);
        let contents = &rendered.config_files[0].1;
        assert!(contents.contains("server-port=25565\n"));
        assert!(contents.contains("motd=hello\n"));
    }

    #[test]
    fn startup_parser_object_is_rendered_in_place() {
        let data = start_data(CoreSpec {
            startup_command: "./server".to_string(),
            startup_parser: json!({"done": "listening on {{SERVER_PORT}}"}),
            ..Default::default()
        });
        let rendered = render(&data);
        assert_eq!(rendered.startup_parser["done"], "listening on 25565");
    }

    #[test]
    fn additional_allocation_key_is_singular() {
        let data: StartData = serde_json::from_value(json!({
            "memory": 1024,
            "cpu": 500,
            "disk": 5120,
            "environment": {},
            "primaryAllocation": {"ip": "0.0.0.0", "port": 7777},
            "additionalAllocation": [{"ip": "0.0.0.0", "port": 7778}],
            "image": "busybox:latest",
            "core": {"startupCommand": "./srv"}
        }))
        .unwrap();
        assert_eq!(data.additional_allocations.len(), 1);
        assert_eq!(data.all_allocations().len(), 2);
    }
}
