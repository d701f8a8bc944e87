//! Files installed into the sandbox by plugins, and the cell-magic rewriter.

/// Code run in a fresh interpreter when the agent-skills plugin is present.
pub const AGENT_SKILLS_INIT_CODE: &str = "from agentskills import *";

/// Line printed by `%pip` when an install needs an interpreter restart.
pub const KERNEL_RESTART_NOTE: &str =
    "Note: you may need to restart the kernel to use updated packages.";

pub(crate) const DRIVER_FILE: &str = "skiff_driver.py";
pub(crate) const AGENT_SKILLS_FILE: &str = "agentskills.py";

/// Persistent interpreter loop. Reads a cell terminated by `<marker>_END`,
/// runs it with IPython-like display of the trailing expression, then prints
/// `<marker><status>` on its own line.
pub(crate) const DRIVER_SOURCE: &str = r#"import ast
import shlex
import subprocess
import sys
import traceback

MARK = sys.argv[1]
END = MARK + "_END"
RESTART_NOTE = "Note: you may need to restart the kernel to use updated packages."
sys.stderr = sys.stdout


def __skiff_sh__(command):
    proc = subprocess.run(
        command, shell=True, stdout=subprocess.PIPE, stderr=subprocess.STDOUT, text=True
    )
    print(proc.stdout, end="")


def __skiff_pip__(args):
    proc = subprocess.run(
        [sys.executable, "-m", "pip"] + shlex.split(args),
        stdout=subprocess.PIPE,
        stderr=subprocess.STDOUT,
        text=True,
    )
    print(proc.stdout, end="")
    if proc.returncode == 0 and "Successfully installed" in proc.stdout:
        print(RESTART_NOTE)


namespace = {
    "__name__": "__main__",
    "__skiff_sh__": __skiff_sh__,
    "__skiff_pip__": __skiff_pip__,
}


def run_cell(code):
    tree = ast.parse(code, "<cell>", "exec")
    last = None
    if tree.body and isinstance(tree.body[-1], ast.Expr):
        last = ast.Expression(tree.body.pop().value)
    exec(compile(tree, "<cell>", "exec"), namespace)
    if last is not None:
        value = eval(compile(last, "<cell>", "eval"), namespace)
        if value is not None:
            print(repr(value))


while True:
    lines = []
    for line in sys.stdin:
        if line.rstrip("\n") == END:
            break
        lines.append(line)
    else:
        break
    status = 0
    try:
        run_cell("".join(lines))
    except SystemExit:
        pass
    except BaseException:
        traceback.print_exc(file=sys.stdout)
        status = 1
    sys.stdout.flush()
    print("\n" + MARK + str(status), flush=True)
"#;

/// Helper library importable as `agentskills`.
pub(crate) const AGENT_SKILLS_SOURCE: &str = r#""""File helpers available to the agent inside the interpreter."""
import os

__all__ = ["open_file", "create_file", "search_dir", "search_file", "find_file"]


def open_file(path, line_number=1, context_lines=100):
    with open(path, encoding="utf-8") as f:
        lines = f.readlines()
    start = max(0, line_number - 1)
    end = min(len(lines), start + context_lines)
    print(f"[File: {os.path.abspath(path)} ({len(lines)} lines total)]")
    for index in range(start, end):
        print(f"{index + 1}|{lines[index]}", end="")
    if end < len(lines):
        print(f"\n({len(lines) - end} more lines below)")


def create_file(path):
    if os.path.exists(path):
        raise FileExistsError(f"File '{path}' already exists.")
    with open(path, "w", encoding="utf-8"):
        pass
    print(f"[File {path} created.]")


def search_file(term, path):
    with open(path, encoding="utf-8") as f:
        hits = [(n, line) for n, line in enumerate(f, 1) if term in line]
    print(f'[Found {len(hits)} matches for "{term}" in {path}]')
    for n, line in hits:
        print(f"Line {n}: {line.rstrip()}")


def search_dir(term, dir_path="./"):
    hits = {}
    for root, _, files in os.walk(dir_path):
        for name in files:
            if name.startswith("."):
                continue
            path = os.path.join(root, name)
            try:
                with open(path, encoding="utf-8") as f:
                    count = sum(line.count(term) for line in f)
            except (UnicodeDecodeError, OSError):
                continue
            if count:
                hits[path] = count
    print(f'[Found {sum(hits.values())} matches for "{term}" in {dir_path}]')
    for path, count in hits.items():
        print(f"{path} ({count} matches)")


def find_file(file_name, dir_path="./"):
    matches = [
        os.path.join(root, name)
        for root, _, files in os.walk(dir_path)
        for name in files
        if file_name in name
    ]
    print(f'[Found {len(matches)} matches for "{file_name}" in {dir_path}]')
    for path in matches:
        print(path)
"#;

/// Rewrites shell escapes in a cell into calls the driver understands:
/// `%pip ...` and `!pip ...` run pip for the interpreter, any other `!cmd`
/// runs in a subshell. Indentation is preserved.
pub fn rewrite_cell_magics(code: &str) -> String {
    code.lines()
        .map(|line| {
            let body = line.trim_start();
            let indent = &line[..line.len() - body.len()];
            let pip_args = body
                .strip_prefix("%pip ")
                .or_else(|| body.strip_prefix("!pip "));
            if let Some(args) = pip_args {
                format!("{indent}__skiff_pip__({})", py_string(args.trim()))
            } else if let Some(command) = body.strip_prefix('!') {
                format!("{indent}__skiff_sh__({})", py_string(command))
            } else {
                line.to_owned()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// JSON string literals are valid Python string literals.
fn py_string(text: &str) -> String {
    serde_json::Value::String(text.to_owned()).to_string()
}
