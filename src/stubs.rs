//! Python stubs for host tools.
//!
//! Every tool in the catalogue becomes an `async def` in the guest namespace.
//! Required parameters are positional, optional ones are keyword-only and
//! default to `None`; only declared parameters are ever forwarded.

use std::collections::HashSet;
use std::fmt::Write;

use serde_json::Value;

use crate::tools::ToolDescriptor;

const PY_KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if",
    "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try",
    "while", "with", "yield",
];

/// Names the script namespace starts with. Stubs never shadow them.
const SCRIPT_NAMES: &[&str] = &[
    "asyncio",
    "json",
    "sys",
    "call_tool",
    "send_update",
    "ToolError",
    "user_main",
    "Any",
    "Dict",
    "List",
    "Optional",
    "Union",
];

/// Prefix of every runtime-internal name, reserved for the runtime.
const RESERVED_PREFIX: &str = "_ts_";

const ARGS_VAR: &str = "_ts_args";

struct Param {
    wire: String,
    ident: String,
    annotation: String,
    optional: bool,
    description: Option<String>,
}

/// Generate the stub source for a catalogue.
///
/// Pure and deterministic: the same catalogue always yields the same text.
pub fn generate(tools: &[ToolDescriptor]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Tool stubs ({} tools)", tools.len());

    let mut taken: HashSet<String> = SCRIPT_NAMES.iter().map(|s| s.to_string()).collect();
    for tool in tools {
        let ident = unique_ident(&unreserved(python_identifier(&tool.name)), &mut taken);
        out.push('\n');
        render_tool(&mut out, &ident, tool);
    }
    out
}

fn render_tool(out: &mut String, ident: &str, tool: &ToolDescriptor) {
    let params = collect_params(&tool.parameter_schema);

    let mut signature: Vec<String> = params
        .iter()
        .filter(|p| !p.optional)
        .map(|p| format!("{}: {}", p.ident, p.annotation))
        .collect();
    if params.iter().any(|p| p.optional) {
        signature.push("*".to_string());
        signature.extend(
            params
                .iter()
                .filter(|p| p.optional)
                .map(|p| format!("{}: {} = None", p.ident, optional_annotation(&p.annotation))),
        );
    }

    let _ = writeln!(out, "async def {}({}) -> str:", ident, signature.join(", "));
    let _ = writeln!(out, "    \"\"\"{}\"\"\"", docstring(tool, &params));
    let _ = writeln!(out, "    {ARGS_VAR}: Dict[str, Any] = {{}}");
    for param in &params {
        let key = py_string(&param.wire);
        if param.optional {
            let _ = writeln!(out, "    if {} is not None:", param.ident);
            let _ = writeln!(out, "        {ARGS_VAR}[{}] = {}", key, param.ident);
        } else {
            let _ = writeln!(out, "    {ARGS_VAR}[{}] = {}", key, param.ident);
        }
    }
    let _ = writeln!(
        out,
        "    return await _ts_call_tool_text({}, {ARGS_VAR})",
        py_string(&tool.name)
    );
}

fn collect_params(schema: &Value) -> Vec<Param> {
    let properties = schema.get("properties").and_then(Value::as_object);
    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let mut taken: HashSet<String> = [ARGS_VAR.to_string()].into_iter().collect();
    let mut params = Vec::new();

    // Required parameters keep the order of the `required` list.
    let mut seen = HashSet::new();
    for name in &required {
        if !seen.insert(*name) {
            continue;
        }
        let prop = properties.and_then(|p| p.get(*name)).unwrap_or(&Value::Null);
        params.push(make_param(name, prop, is_nullable(prop), &mut taken));
    }

    if let Some(properties) = properties {
        for (name, prop) in properties {
            if required.contains(&name.as_str()) {
                continue;
            }
            params.push(make_param(name, prop, true, &mut taken));
        }
    }

    params
}

fn make_param(name: &str, prop: &Value, optional: bool, taken: &mut HashSet<String>) -> Param {
    Param {
        wire: name.to_string(),
        ident: unique_ident(&unreserved(python_identifier(name)), taken),
        annotation: python_type(prop, 0),
        optional,
        description: prop
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

/// Map a property schema onto a Python annotation.
///
/// Array items recurse one level; objects collapse to `Dict[str, Any]`.
pub fn python_type(prop: &Value, depth: usize) -> String {
    let mut kinds: Vec<String> = Vec::new();
    for kind in schema_kinds(prop) {
        let mapped = match kind.as_str() {
            "string" => "str".to_string(),
            "number" => "float".to_string(),
            "integer" => "int".to_string(),
            "boolean" => "bool".to_string(),
            "null" => continue,
            "object" => "Dict[str, Any]".to_string(),
            "array" if depth == 0 => {
                let items = prop.get("items").unwrap_or(&Value::Null);
                format!("List[{}]", python_type(items, depth + 1))
            }
            "array" => "List[Any]".to_string(),
            _ => "Any".to_string(),
        };
        if !kinds.contains(&mapped) {
            kinds.push(mapped);
        }
    }

    match kinds.len() {
        0 if schema_kinds(prop).iter().any(|k| k == "null") => "None".to_string(),
        0 => "Any".to_string(),
        1 => kinds.remove(0),
        _ if kinds.iter().any(|k| k == "Any") => "Any".to_string(),
        _ => format!("Union[{}]", kinds.join(", ")),
    }
}

/// Declared kinds of a schema, flattening `type` arrays and `anyOf`/`oneOf`.
fn schema_kinds(prop: &Value) -> Vec<String> {
    match prop.get("type") {
        Some(Value::String(kind)) => vec![kind.clone()],
        Some(Value::Array(kinds)) => kinds
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => ["anyOf", "oneOf"]
            .iter()
            .filter_map(|key| prop.get(*key).and_then(Value::as_array))
            .flatten()
            .flat_map(|branch| {
                let kinds = schema_kinds(branch);
                if kinds.is_empty() {
                    vec!["any".to_string()]
                } else {
                    kinds
                }
            })
            .collect(),
    }
}

fn is_nullable(prop: &Value) -> bool {
    prop.get("nullable").and_then(Value::as_bool) == Some(true)
        || schema_kinds(prop).iter().any(|k| k == "null")
}

fn optional_annotation(annotation: &str) -> String {
    match annotation {
        "Any" | "None" => annotation.to_string(),
        _ => format!("Optional[{annotation}]"),
    }
}

fn docstring(tool: &ToolDescriptor, params: &[Param]) -> String {
    let mut doc = tool.description.trim().to_string();
    if !params.is_empty() {
        if !doc.is_empty() {
            doc.push_str("\n\n");
        }
        doc.push_str("Args:");
        for param in params {
            let _ = write!(doc, "\n    {}", param.ident);
            if param.optional {
                doc.push_str(" (optional)");
            }
            if let Some(desc) = &param.description {
                let _ = write!(doc, ": {}", desc.trim());
            }
        }
    }
    doc.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\n    ")
}

/// Turn an arbitrary name into a valid Python identifier.
pub fn python_identifier(name: &str) -> String {
    let mut ident: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if ident.is_empty() || ident.starts_with(|c: char| c.is_ascii_digit()) {
        ident.insert(0, '_');
    }
    if PY_KEYWORDS.contains(&ident.as_str()) {
        ident.push('_');
    }
    ident
}

fn unreserved(ident: String) -> String {
    if ident.starts_with(RESERVED_PREFIX) {
        format!("_{ident}")
    } else {
        ident
    }
}

fn unique_ident(base: &str, taken: &mut HashSet<String>) -> String {
    let mut ident = base.to_string();
    let mut n = 2;
    while taken.contains(&ident) {
        ident = format!("{base}_{n}");
        n += 1;
    }
    taken.insert(ident.clone());
    ident
}

/// Python string literal. JSON string syntax is a subset of Python's.
pub(crate) fn py_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn search_tool() -> ToolDescriptor {
        ToolDescriptor::new(
            "search",
            "Search the index",
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "What to look for"},
                    "limit": {"type": "integer"}
                },
                "required": ["query"]
            }),
        )
    }

    #[test]
    fn generation_is_deterministic() {
        let tools = vec![
            search_tool(),
            ToolDescriptor::new("read-file", "", json!({"properties": {"path": {}}})),
        ];
        assert_eq!(generate(&tools), generate(&tools.clone()));
    }

    #[test]
    fn required_positional_optional_keyword_only() {
        let source = generate(&[search_tool()]);
        assert!(
            source.contains("async def search(query: str, *, limit: Optional[int] = None) -> str:"),
            "{source}"
        );
        assert!(source.contains("    _ts_args[\"query\"] = query\n"));
        assert!(source
            .contains("    if limit is not None:\n        _ts_args[\"limit\"] = limit\n"));
        assert!(source.contains("return await _ts_call_tool_text(\"search\", _ts_args)"));
    }

    #[test]
    fn nullable_required_param_is_optional() {
        let tool = ToolDescriptor::new(
            "t",
            "",
            json!({
                "properties": {"a": {"type": ["string", "null"]}, "b": {"type": "boolean"}},
                "required": ["a", "b"]
            }),
        );
        let source = generate(&[tool]);
        assert!(
            source.contains("async def t(b: bool, *, a: Optional[str] = None) -> str:"),
            "{source}"
        );
    }

    #[test]
    fn type_mapping() {
        assert_eq!(python_type(&json!({"type": "number"}), 0), "float");
        assert_eq!(python_type(&json!({"type": "null"}), 0), "None");
        assert_eq!(python_type(&json!({"type": "object"}), 0), "Dict[str, Any]");
        assert_eq!(python_type(&json!({}), 0), "Any");
        assert_eq!(python_type(&json!({"type": "weird"}), 0), "Any");
        assert_eq!(
            python_type(&json!({"type": "array", "items": {"type": "string"}}), 0),
            "List[str]"
        );
        assert_eq!(
            python_type(
                &json!({"type": "array", "items": {"type": "array", "items": {"type": "string"}}}),
                0
            ),
            "List[List[Any]]"
        );
        assert_eq!(
            python_type(&json!({"anyOf": [{"type": "integer"}, {"type": "string"}]}), 0),
            "Union[int, str]"
        );
        assert_eq!(python_type(&json!({"type": ["integer", "null"]}), 0), "int");
    }

    #[test]
    fn identifiers_are_sanitized_but_wire_names_kept() {
        let tool = ToolDescriptor::new(
            "fs.read-file",
            "",
            json!({"properties": {"class": {"type": "string"}}, "required": ["class"]}),
        );
        let source = generate(&[tool]);
        assert!(source.contains("async def fs_read_file(class_: str) -> str:"), "{source}");
        assert!(source.contains("_ts_args[\"class\"] = class_"));
        assert!(source.contains("_ts_call_tool_text(\"fs.read-file\", _ts_args)"));
    }

    #[test]
    fn colliding_names_get_suffixes() {
        let tools = vec![
            ToolDescriptor::new("a-b", "", json!({})),
            ToolDescriptor::new("a_b", "", json!({})),
            ToolDescriptor::new("call_tool", "", json!({})),
        ];
        let source = generate(&tools);
        assert!(source.contains("async def a_b() -> str:"));
        assert!(source.contains("async def a_b_2() -> str:"));
        assert!(source.contains("async def call_tool_2() -> str:"));
    }

    #[test]
    fn runtime_prefix_is_never_generated() {
        let tools = vec![
            ToolDescriptor::new("_ts_call_tool_text", "", json!({})),
            ToolDescriptor::new(
                "t",
                "",
                json!({"properties": {"_ts_args": {}, "_ts_rpc": {}}, "required": ["_ts_rpc"]}),
            ),
        ];
        let source = generate(&tools);
        assert!(source.contains("async def __ts_call_tool_text() -> str:"), "{source}");
        assert!(
            source.contains("async def t(__ts_rpc: Any, *, __ts_args: Any = None)"),
            "{source}"
        );
        assert!(source.contains("_ts_args[\"_ts_args\"] = __ts_args"));
        assert!(!source.contains("async def _ts_"));
    }

    #[test]
    fn module_names_are_ordinary_tool_names() {
        let tools = vec![
            ToolDescriptor::new("time", "", json!({})),
            ToolDescriptor::new("os", "", json!({})),
        ];
        let source = generate(&tools);
        assert!(source.contains("async def time() -> str:"));
        assert!(source.contains("async def os() -> str:"));
    }

    #[test]
    fn docstring_is_escaped() {
        let tool = ToolDescriptor::new("q", "say \"\"\"hi\"\"\" \\ ok\nsecond line", json!({}));
        let source = generate(&[tool]);
        assert!(source.contains(r#""""say \"\"\"hi\"\"\" \\ ok"#), "{source}");
        assert!(source.contains("\n    second line\"\"\"\n"));
    }
}
