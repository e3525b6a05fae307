//! Guest-side runtime and program assembly.
//!
//! The program handed to the interpreter is the RPC client and the driver,
//! followed by a trailer that passes the tool stubs and the wrapped user
//! script to the driver as string literals. The driver compiles both into a
//! namespace of their own, so nothing a stub defines can replace a runtime
//! global.

use crate::stubs::py_string;

/// Line-delimited JSON client, `ToolError`, `call_tool` and `send_update`.
pub const RPC_CLIENT: &str = include_str!("rpc.py");

/// `_ts_runtime_main`: builds the script namespace, runs the wrapper and
/// reports `complete` or `error`.
pub const DRIVER: &str = include_str!("driver.py");

const WRAPPER_HEADER: &str = "async def user_main():";
const INDENT: &str = "    ";

/// A complete guest program plus where the user's script sits inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestProgram {
    pub source: String,
    /// Line of the wrapper header in the compiled script; user line `n` is
    /// script line `line_offset + n`.
    pub line_offset: usize,
    /// Number of lines in the user's script
    pub total_lines: usize,
}

/// Assemble the guest program around a user script.
pub fn compose(stubs: &str, script: &str) -> GuestProgram {
    let (wrapper, total_lines) = wrap_script(script);
    let line_offset = 1;

    let mut source =
        String::with_capacity(RPC_CLIENT.len() + DRIVER.len() + stubs.len() + wrapper.len() + 256);
    push_section(&mut source, RPC_CLIENT);
    push_section(&mut source, DRIVER);
    source.push_str("_ts_ok = _ts_asyncio.run(_ts_runtime_main(\n");
    source.push_str(&format!("    {},\n", py_string(stubs)));
    source.push_str(&format!("    {},\n", py_string(&wrapper)));
    source.push_str(&format!("    line_offset={line_offset},\n"));
    source.push_str(&format!("    total_lines={total_lines},\n"));
    source.push_str("))\n_ts_sys.exit(0 if _ts_ok else 1)\n");

    GuestProgram {
        source,
        line_offset,
        total_lines,
    }
}

/// Indent the script under the wrapper header. Returns the wrapper source
/// and the script's line count.
fn wrap_script(script: &str) -> (String, usize) {
    let script = script.replace("\r\n", "\n");
    let mut wrapper = String::with_capacity(script.len() * 2 + WRAPPER_HEADER.len() + 16);
    wrapper.push_str(WRAPPER_HEADER);
    wrapper.push('\n');

    let mut total_lines = 0;
    let mut has_code = false;
    for line in script.lines() {
        total_lines += 1;
        if line.trim().is_empty() {
            wrapper.push('\n');
            continue;
        }
        if !line.trim_start().starts_with('#') {
            has_code = true;
        }
        wrapper.push_str(INDENT);
        wrapper.push_str(line);
        wrapper.push('\n');
    }
    if !has_code {
        wrapper.push_str(INDENT);
        wrapper.push_str("pass\n");
    }
    (wrapper, total_lines)
}

fn push_section(out: &mut String, section: &str) {
    out.push_str(section.trim_end());
    out.push_str("\n\n\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_is_wrapped_and_indented() {
        let (wrapper, total) = wrap_script("x = 1\n\nreturn x + 1");
        assert_eq!(wrapper, "async def user_main():\n    x = 1\n\n    return x + 1\n");
        assert_eq!(total, 3);
    }

    #[test]
    fn line_offset_points_at_wrapper_header() {
        let program = compose("", "first\nsecond");
        let (wrapper, _) = wrap_script("first\nsecond");
        let lines: Vec<&str> = wrapper.lines().collect();
        // Script lines are 1-based.
        assert_eq!(lines[program.line_offset - 1], WRAPPER_HEADER);
        assert_eq!(lines[program.line_offset], "    first");
        assert_eq!(lines[program.line_offset + 1], "    second");
        assert!(program.source.contains(&format!(
            "line_offset={},\n    total_lines=2,",
            program.line_offset
        )));
    }

    #[test]
    fn empty_or_comment_only_script_still_compiles() {
        for script in ["", "   \n", "# nothing here"] {
            let (wrapper, _) = wrap_script(script);
            assert!(
                wrapper.starts_with("async def user_main():\n") && wrapper.ends_with("    pass\n"),
                "{script:?}"
            );
        }
    }

    #[test]
    fn crlf_is_normalized() {
        let program = compose("", "a = 1\r\nreturn a\r\n");
        assert!(program.source.contains(r#""async def user_main():\n    a = 1\n    return a\n""#));
        assert!(!program.source.contains('\r'));
    }

    #[test]
    fn stubs_and_script_travel_as_literals() {
        let stubs = "async def t() -> str:\n    pass\n";
        let program = compose(stubs, "return \"hi\"");
        let driver = program.source.find("async def _ts_runtime_main").unwrap();
        let stub = program.source.find(&py_string(stubs)).unwrap();
        let wrapper = program
            .source
            .find(r#""async def user_main():\n    return \"hi\"\n""#)
            .unwrap();
        assert!(driver < stub && stub < wrapper);
        assert!(program.source.ends_with("_ts_sys.exit(0 if _ts_ok else 1)\n"));
    }

    #[test]
    fn runtime_keeps_its_globals_private() {
        // Every module-level name the runtime binds is either part of the
        // script surface or carries the reserved prefix.
        let public = ["ToolError", "call_tool", "send_update"];
        for line in RPC_CLIENT.lines().chain(DRIVER.lines()) {
            let name = if let Some(rest) = line.strip_prefix("import ") {
                rest.rsplit(" as ").next().unwrap_or(rest)
            } else if let Some(rest) = line
                .strip_prefix("async def ")
                .or_else(|| line.strip_prefix("def "))
                .or_else(|| line.strip_prefix("class "))
            {
                rest.split(|c| c == '(' || c == ':').next().unwrap_or(rest)
            } else if let Some((lhs, _)) = line.split_once(" = ") {
                if lhs.starts_with(char::is_whitespace) || lhs.contains('.') {
                    continue;
                }
                lhs
            } else {
                continue;
            };
            assert!(
                name.starts_with("_ts_") || name.starts_with("_Ts") || public.contains(&name),
                "runtime global {name:?}"
            );
        }
    }
}
