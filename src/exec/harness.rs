//! The Python side of an execution.
//!
//! [`HARNESS`] runs as `python3 -c`. It reads a [`ProgramHeader`] line and
//! the program from stdin, installs an audit-hook guard, runs the program
//! against the [`RUNTIME`] helpers and writes exactly one nonce-tagged
//! [`HarnessReport`] to fd 3. Nonce, grants and the guard live in function
//! locals and closures the program cannot reach.

use crate::config::types::{Capability, ExecutionLimits};
use crate::translate::codegen::python_string;
use serde::{Deserialize, Serialize};

/// Descriptor the harness writes its report to.
pub const REPORT_FD: i32 = 3;

/// `_rt_` helpers implementing DSL semantics for generated code.
pub const RUNTIME: &str = r#"class _rt_Error(Exception):
    pass


class _rt_Return(BaseException):
    def __init__(self, value):
        BaseException.__init__(self)
        self.value = value


_rt_I64_MIN = -(1 << 63)
_rt_I64_MAX = (1 << 63) - 1
_rt_MAX_DEPTH = 100
_rt_MAX_CALLS = 256
_rt_calls = [0]


def _rt_checked(n):
    if n < _rt_I64_MIN or n > _rt_I64_MAX:
        raise _rt_Error("integer overflow")
    return n


def _rt_type(v):
    t = type(v)
    if v is None:
        return "nil"
    if t is bool:
        return "bool"
    if t is int:
        return "int"
    if t is float:
        return "float"
    if t is str:
        return "string"
    if t is list:
        return "list"
    if getattr(v, "_rt_arity", None) is not None:
        return "function"
    return t.__name__


def _rt_isnum(v):
    t = type(v)
    return t is int or t is float


def _rt_numeric(a, b, op):
    if not (_rt_isnum(a) and _rt_isnum(b)):
        raise _rt_Error("unsupported operand types for %s: %s and %s" % (op, _rt_type(a), _rt_type(b)))
    return type(a) is float or type(b) is float


def _rt_add(a, b):
    ta = type(a)
    if ta is type(b) and (ta is str or ta is list):
        return a + b
    if _rt_numeric(a, b, "+"):
        return float(a) + float(b)
    return _rt_checked(a + b)


def _rt_sub(a, b):
    if _rt_numeric(a, b, "-"):
        return float(a) - float(b)
    return _rt_checked(a - b)


def _rt_mul(a, b):
    if _rt_numeric(a, b, "*"):
        return float(a) * float(b)
    return _rt_checked(a * b)


def _rt_div(a, b):
    if _rt_numeric(a, b, "/"):
        if float(b) == 0.0:
            raise _rt_Error("division by zero")
        return float(a) / float(b)
    if b == 0:
        raise _rt_Error("division by zero")
    q = abs(a) // abs(b)
    if (a < 0) != (b < 0):
        q = -q
    return _rt_checked(q)


def _rt_mod(a, b):
    if _rt_numeric(a, b, "%"):
        if float(b) == 0.0:
            raise _rt_Error("division by zero")
        try:
            return _rt_fmod(float(a), float(b))
        except ValueError:
            return float("nan")
    if b == 0:
        raise _rt_Error("division by zero")
    r = abs(a) % abs(b)
    return -r if a < 0 else r


def _rt_neg(v):
    t = type(v)
    if t is int:
        return _rt_checked(-v)
    if t is float:
        return -v
    raise _rt_Error("cannot negate %s" % _rt_type(v))


def _rt_equal(a, b, depth):
    if depth > _rt_MAX_DEPTH:
        raise _rt_Error("value nested too deeply")
    ta = type(a)
    tb = type(b)
    if ta is bool or tb is bool:
        return ta is tb and a == b
    if _rt_isnum(a) and _rt_isnum(b):
        if ta is tb:
            return a == b
        return float(a) == float(b)
    if ta is not tb:
        return False
    if ta is list:
        if len(a) != len(b):
            return False
        for x, y in zip(a, b):
            if not _rt_equal(x, y, depth + 1):
                return False
        return True
    if a is None or ta is str:
        return a == b
    return a is b


def _rt_eq(a, b):
    return _rt_equal(a, b, 0)


def _rt_ne(a, b):
    return not _rt_equal(a, b, 0)


def _rt_ordered(a, b, op):
    ta = type(a)
    tb = type(b)
    if ta is str and tb is str:
        return a, b
    if _rt_isnum(a) and _rt_isnum(b):
        if ta is int and tb is int:
            return a, b
        return float(a), float(b)
    raise _rt_Error("cannot compare %s and %s with %s" % (_rt_type(a), _rt_type(b), op))


def _rt_lt(a, b):
    a, b = _rt_ordered(a, b, "<")
    return a < b


def _rt_le(a, b):
    a, b = _rt_ordered(a, b, "<=")
    return a <= b


def _rt_gt(a, b):
    a, b = _rt_ordered(a, b, ">")
    return a > b


def _rt_ge(a, b):
    a, b = _rt_ordered(a, b, ">=")
    return a >= b


def _rt_truthy(v):
    return not (v is None or v is False)


def _rt_index(o, i):
    t = type(o)
    if t is not list and t is not str:
        raise _rt_Error("cannot index %s" % _rt_type(o))
    if type(i) is not int:
        raise _rt_Error("index must be an int, found %s" % _rt_type(i))
    if i < 0 or i >= len(o):
        raise _rt_Error("index out of range")
    return o[i]


def _rt_setindex(o, i, v):
    t = type(o)
    if t is str:
        raise _rt_Error("strings are immutable")
    if t is not list:
        raise _rt_Error("cannot index %s" % _rt_type(o))
    if type(i) is not int:
        raise _rt_Error("index must be an int, found %s" % _rt_type(i))
    if i < 0 or i >= len(o):
        raise _rt_Error("index out of range")
    o[i] = v


def _rt_range(a, b):
    if type(a) is not int or type(b) is not int:
        raise _rt_Error("range bounds must be ints, found %s and %s" % (_rt_type(a), _rt_type(b)))
    return range(a, b)


def _rt_declare(f, name, arity):
    f._rt_name = name
    f._rt_arity = arity


def _rt_call(f, *args):
    arity = getattr(f, "_rt_arity", None)
    if arity is None:
        raise _rt_Error("%s is not a function" % _rt_type(f))
    if len(args) != arity:
        raise _rt_Error("%s() takes %d argument(s) but %d were given" % (f._rt_name, arity, len(args)))
    if _rt_calls[0] >= _rt_MAX_CALLS:
        raise _rt_Error("maximum recursion depth exceeded")
    _rt_calls[0] += 1
    try:
        return f(*args)
    finally:
        _rt_calls[0] -= 1


def _rt_return(v):
    raise _rt_Return(v)


def _rt_quote(s):
    out = ['"']
    for c in s:
        if c == "\\":
            out.append("\\\\")
        elif c == '"':
            out.append('\\"')
        elif c == "\n":
            out.append("\\n")
        elif c == "\t":
            out.append("\\t")
        elif c == "\r":
            out.append("\\r")
        elif c == "\0":
            out.append("\\0")
        elif c < " " or c == "\x7f":
            out.append("\\u{%x}" % ord(c))
        else:
            out.append(c)
    out.append('"')
    return "".join(out)


def _rt_show(v, depth, quoted):
    if depth > _rt_MAX_DEPTH:
        raise _rt_Error("value nested too deeply")
    t = type(v)
    if v is None:
        return "nil"
    if v is True:
        return "true"
    if v is False:
        return "false"
    if t is int:
        return str(v)
    if t is float:
        return repr(v)
    if t is str:
        return _rt_quote(v) if quoted else v
    if t is list:
        return "[" + ", ".join([_rt_show(x, depth + 1, True) for x in v]) + "]"
    name = getattr(v, "_rt_name", None)
    if name is not None:
        return "<fn %s>" % name
    return "<%s>" % t.__name__


def _rt_str(v):
    return _rt_show(v, 0, False)


def _rt_print(*args):
    _rt_write(" ".join([_rt_show(a, 0, False) for a in args]) + "\n")
    return None


def _rt_len(v):
    t = type(v)
    if t is str or t is list:
        return len(v)
    raise _rt_Error("len() expects a string or list, found %s" % _rt_type(v))


def _rt_digits(s):
    return len(s) > 0 and all(c in "0123456789" for c in s)


def _rt_trim(s):
    return s.strip(" \t\n\r")


def _rt_int(v):
    t = type(v)
    if t is int:
        return v
    if t is float:
        if v != v or v in (float("inf"), float("-inf")):
            raise _rt_Error("cannot convert %s to int" % repr(v))
        return _rt_checked(int(v))
    if t is str:
        s = _rt_trim(v)
        body = s[1:] if s[:1] in ("+", "-") else s
        if not _rt_digits(body):
            raise _rt_Error("invalid integer: %s" % _rt_quote(v))
        if len(body.lstrip("0")) > 19:
            raise _rt_Error("integer overflow")
        return _rt_checked(int(s))
    raise _rt_Error("int() expects a number or string, found %s" % _rt_type(v))


def _rt_float_text(s):
    body = s[1:] if s[:1] in ("+", "-") else s
    mantissa, _, exponent = body.replace("E", "e").partition("e")
    if _ or exponent:
        digits = exponent[1:] if exponent[:1] in ("+", "-") else exponent
        if not _rt_digits(digits):
            return False
    whole, dot, frac = mantissa.partition(".")
    if not whole and not frac:
        return False
    return (not whole or _rt_digits(whole)) and (not frac or _rt_digits(frac))


def _rt_float(v):
    t = type(v)
    if t is float:
        return v
    if t is int:
        return float(v)
    if t is str:
        s = _rt_trim(v)
        if not _rt_float_text(s):
            raise _rt_Error("invalid float: %s" % _rt_quote(v))
        return float(s)
    raise _rt_Error("float() expects a number or string, found %s" % _rt_type(v))


def _rt_abs(v):
    t = type(v)
    if t is int:
        return _rt_checked(abs(v))
    if t is float:
        return abs(v)
    raise _rt_Error("abs() expects a number, found %s" % _rt_type(v))


def _rt_push(l, v):
    if type(l) is not list:
        raise _rt_Error("push() expects a list, found %s" % _rt_type(l))
    l.append(v)
    return None


def _rt_pop(l):
    if type(l) is not list:
        raise _rt_Error("pop() expects a list, found %s" % _rt_type(l))
    if not l:
        raise _rt_Error("pop() from an empty list")
    return l.pop()
"#;

/// Harness entry point; expects `_RT_SOURCE` to hold [`RUNTIME`].
pub const HARNESS: &str = r#"def _twibox_main(runtime_source):
    import sys, os, json, math

    raw = sys.stdin.buffer.read()
    header, _, body = raw.partition(b"\n")
    del raw
    cfg = json.loads(header.decode("utf-8"))
    nonce = cfg["nonce"]
    grants = frozenset(cfg["grants"])
    scratch = cfg.get("scratch_dir")
    if "network" in grants:
        import socket
    if "subprocess" in grants:
        import subprocess

    _write = os.write
    _exit = os._exit
    _dumps = json.dumps
    _realpath = os.path.realpath
    _getframe = sys._getframe
    _flush = sys.stdout.flush
    sep = os.sep
    report_fd = 3
    trusted = [False]
    memory_report = (_dumps({"nonce": nonce, "status": "memory"}) + "\n").encode("ascii")

    def emit(data):
        try:
            _flush()
        except BaseException:
            pass
        try:
            while data:
                data = data[_write(report_fd, data):]
        except OSError:
            pass

    def report(payload):
        payload["nonce"] = nonce
        emit((_dumps(payload) + "\n").encode("utf-8"))

    net_modules = frozenset(["socket", "_socket", "ssl", "_ssl", "http", "urllib", "ftplib",
                             "smtplib", "poplib", "imaplib", "nntplib", "telnetlib", "select",
                             "selectors", "asyncio", "socketserver", "xmlrpc", "webbrowser"])
    proc_modules = frozenset(["subprocess", "_posixsubprocess", "pty", "multiprocessing",
                              "_multiprocessing", "concurrent"])
    intro_modules = frozenset(["ctypes", "_ctypes", "gc", "inspect", "tracemalloc", "faulthandler",
                               "dis", "code", "codeop", "pdb", "bdb", "trace", "marshal", "pickle",
                               "_pickle", "_testcapi", "importlib"])
    proc_events = frozenset(["subprocess.Popen", "os.system", "os.fork", "os.forkpty", "os.kill",
                             "os.killpg", "pty.spawn", "os.startfile"])
    env_events = frozenset(["os.putenv", "os.unsetenv"])
    intro_events = frozenset(["sys.settrace", "sys.setprofile", "sys.addaudithook",
                              "builtins.breakpoint", "pickle.find_class"])
    net_prefixes = ("socket.", "http.", "urllib.", "ftplib.", "smtplib.", "poplib.", "imaplib.",
                    "nntplib.", "telnetlib.", "webbrowser.")
    intro_prefixes = ("ctypes.", "gc.", "sys._", "code.", "function.", "marshal.", "cpython.", "object.")
    readable_events = frozenset(["open", "os.listdir", "os.scandir"])

    def classify(event, args):
        if event == "open" or event in ("os.listdir", "os.scandir"):
            return "filesystem"
        if event == "import":
            top = str(args[0]).partition(".")[0]
            if top in net_modules:
                return "network"
            if top in proc_modules:
                return "subprocess"
            if top in intro_modules:
                return "introspection"
            return "module_import"
        if event in proc_events or event.startswith(("os.exec", "os.spawn", "os.posix_spawn")):
            return "subprocess"
        if event in env_events:
            return "environment"
        if event.startswith(net_prefixes):
            return "network"
        if event in intro_events or event.startswith(intro_prefixes):
            return "introspection"
        if event.startswith(("os.", "shutil.", "glob.", "tempfile.", "fcntl.", "mmap.")):
            return "filesystem"
        return None

    def read_only(event, args):
        if event != "open":
            return True
        mode = args[1] if len(args) > 1 else None
        if isinstance(mode, str):
            return all(c in "rbt" for c in mode)
        flags = args[2] if len(args) > 2 else 0
        if not isinstance(flags, int):
            return False
        return flags & os.O_ACCMODE == os.O_RDONLY and not flags & (os.O_CREAT | os.O_TRUNC)

    def below(path, root):
        if isinstance(path, bytes):
            path = os.fsdecode(path)
        if not isinstance(path, str):
            return False
        real = _realpath(path)
        return real == root or real.startswith(root.rstrip(sep) + sep)

    def from_importer():
        frame = _getframe(2)
        while frame is not None:
            if frame.f_code.co_filename.startswith("<frozen importlib"):
                return True
            frame = frame.f_back
        return False

    scratch_root = _realpath(scratch) if scratch else None

    def permitted(capability, event, args):
        if event not in readable_events:
            if capability in grants:
                return True
        elif capability in grants and scratch_root and args and read_only(event, args):
            if below(args[0], scratch_root):
                return True
        return "module_import" in grants and event != "import" and from_importer()

    def hook(event, args):
        if trusted[0]:
            return
        capability = classify(event, args)
        if capability is None:
            return
        trusted[0] = True
        try:
            allowed = permitted(capability, event, args)
        except BaseException:
            allowed = False
        trusted[0] = False
        if not allowed:
            trusted[0] = True
            report({"status": "violation", "capability": capability, "event": event})
            _exit(0)

    def demangle(name):
        if name.startswith("v_"):
            return name[2:]
        if not name.startswith("w_"):
            return name
        out = []
        rest = name[2:]
        i = 0
        while i < len(rest):
            c = rest[i]
            if c != "_":
                out.append(c)
                i += 1
            elif rest[i + 1:i + 2] == "_":
                out.append("_")
                i += 2
            else:
                end = rest.index("_", i + 2)
                out.append(chr(int(rest[i + 2:end], 16)))
                i = end + 1
        return "".join(out)

    def quoted_name(message):
        start = message.find("'")
        end = message.find("'", start + 1)
        if start < 0 or end < 0:
            return "?"
        return message[start + 1:end]

    def failing_line(tb):
        trusted[0] = True
        line = None
        while tb is not None:
            if tb.tb_frame.f_code.co_filename == "<program>":
                line = tb.tb_lineno
            tb = tb.tb_next
        trusted[0] = False
        return line

    def failure(message, tb):
        return {"status": "error", "error": {"message": message, "line": failing_line(tb)}}

    ns = {"__name__": "__program__", "_rt_write": sys.stdout.write, "_rt_fmod": math.fmod}
    exec(compile(runtime_source, "<runtime>", "exec"), ns)
    rt_error = ns["_rt_Error"]
    rt_return = ns["_rt_Return"]
    rt_show = ns["_rt_show"]
    try:
        program = compile(body.decode("utf-8"), "<program>", "exec")
    except SyntaxError as err:
        report({"status": "error", "error": {"message": "syntax error: %s" % err.msg, "line": err.lineno}})
        _exit(0)
    del body, header

    sys.setrecursionlimit(int(cfg["recursion_limit"]))
    sys.addaudithook(hook)
    del cfg

    try:
        try:
            exec(program, ns)
            outcome = {"status": "ok", "value": None}
        except rt_return as ret:
            try:
                outcome = {"status": "ok", "value": rt_show(ret.value, 0, False)}
            except rt_error as err:
                outcome = failure(str(err), err.__traceback__)
        except rt_error as err:
            outcome = failure(str(err), err.__traceback__)
        except ZeroDivisionError as err:
            outcome = failure("division by zero", err.__traceback__)
        except NameError as err:
            name = demangle(quoted_name(str(err)))
            outcome = failure("undefined variable '%s'" % name, err.__traceback__)
        except RecursionError as err:
            outcome = failure("maximum recursion depth exceeded", err.__traceback__)
        except SystemExit as err:
            if err.code is None or err.code == 0:
                outcome = {"status": "ok", "value": None}
            else:
                outcome = failure("program exited with status %s" % err.code, err.__traceback__)
        except MemoryError:
            ns.clear()
            emit(memory_report)
            _exit(0)
        except BaseException as err:
            message = str(err) or type(err).__name__
            outcome = failure(message, err.__traceback__)
        trusted[0] = True
        report(outcome)
    except MemoryError:
        ns.clear()
        emit(memory_report)
    _exit(0)


_twibox_main(_RT_SOURCE)
"#;

/// Source passed to the interpreter with `-c`.
pub fn harness_script() -> String {
    format!("_RT_SOURCE = {}\n{}", python_string(RUNTIME), HARNESS)
}

/// First stdin line of every run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgramHeader {
    pub nonce: String,
    pub grants: Vec<Capability>,
    pub scratch_dir: Option<String>,
    pub recursion_limit: u32,
}

impl ProgramHeader {
    pub fn new(nonce: String, limits: &ExecutionLimits, recursion_limit: u32) -> Self {
        Self {
            nonce,
            grants: limits.capabilities.iter().collect(),
            scratch_dir: limits
                .scratch_dir
                .as_ref()
                .map(|dir| dir.to_string_lossy().into_owned()),
            recursion_limit,
        }
    }

    /// Header line followed by the program text.
    pub fn encode(&self, program: &str) -> serde_json::Result<Vec<u8>> {
        let mut payload = serde_json::to_vec(self)?;
        payload.push(b'\n');
        payload.extend_from_slice(program.as_bytes());
        Ok(payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Ok,
    Error,
    Memory,
    Violation,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReportedError {
    pub message: String,
    /// Generated-code line, when the failure came from the program.
    pub line: Option<u32>,
}

/// What the harness says happened.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HarnessReport {
    pub nonce: String,
    pub status: ReportStatus,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub error: Option<ReportedError>,
    #[serde(default)]
    pub capability: Option<Capability>,
    #[serde(default)]
    pub event: Option<String>,
}

/// First well-formed report carrying `nonce`. Lines that fail to parse or
/// carry another nonce were written by the program and are skipped.
pub fn find_report(raw: &[u8], nonce: &str) -> Option<HarnessReport> {
    for line in raw.split(|b| *b == b'\n') {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<HarnessReport>(line) {
            Ok(report) if report.nonce == nonce => return Some(report),
            Ok(_) => log::warn!("Ignoring harness report with a foreign nonce"),
            Err(e) => log::warn!("Ignoring malformed harness report: {}", e),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_defines_runtime_before_harness() {
        let script = harness_script();
        assert!(script.starts_with("_RT_SOURCE = \""));
        assert!(script.contains("def _twibox_main(runtime_source):"));
        assert!(script.trim_end().ends_with("_twibox_main(_RT_SOURCE)"));
        assert!(script.is_ascii());
    }

    #[test]
    fn runtime_defines_every_generated_helper() {
        for helper in [
            "_rt_add", "_rt_sub", "_rt_mul", "_rt_div", "_rt_mod", "_rt_neg", "_rt_eq", "_rt_ne",
            "_rt_lt", "_rt_le", "_rt_gt", "_rt_ge", "_rt_truthy", "_rt_index", "_rt_setindex",
            "_rt_range", "_rt_call", "_rt_declare", "_rt_return", "_rt_print", "_rt_len",
            "_rt_str", "_rt_int", "_rt_float", "_rt_abs", "_rt_push", "_rt_pop", "_rt_type",
        ] {
            assert!(
                RUNTIME.contains(&format!("def {helper}(")),
                "missing runtime helper {helper}"
            );
        }
    }

    #[test]
    fn call_depth_matches_the_reference_interpreter() {
        let line = format!("_rt_MAX_CALLS = {}\n", crate::testing::reference::MAX_CALL_DEPTH);
        assert!(RUNTIME.contains(&line));
        assert!(RUNTIME.contains("raise _rt_Error(\"maximum recursion depth exceeded\")"));
    }

    #[test]
    fn header_precedes_program() {
        let limits = ExecutionLimits::default().granting(Capability::Network);
        let header = ProgramHeader::new("n1".to_string(), &limits, 4000);
        let payload = header.encode("_rt_print(1)\n").unwrap();
        let text = String::from_utf8(payload).unwrap();
        let (first, rest) = text.split_once('\n').unwrap();
        assert_eq!(
            first,
            r#"{"nonce":"n1","grants":["network"],"scratch_dir":null,"recursion_limit":4000}"#
        );
        assert_eq!(rest, "_rt_print(1)\n");
    }

    #[test]
    fn reports_need_the_run_nonce() {
        let raw = concat!(
            "{\"nonce\":\"forged\",\"status\":\"ok\"}\n",
            "not json\n",
            "{\"status\": \"violation\", \"capability\": \"filesystem\", \"event\": \"open\", \"nonce\": \"real\"}\n",
        );
        let report = find_report(raw.as_bytes(), "real").unwrap();
        assert_eq!(report.status, ReportStatus::Violation);
        assert_eq!(report.capability, Some(Capability::Filesystem));
        assert_eq!(report.event.as_deref(), Some("open"));
        assert!(find_report(raw.as_bytes(), "other").is_none());
        assert!(find_report(b"", "real").is_none());
    }

    #[test]
    fn error_reports_carry_lines() {
        let raw = br#"{"status": "error", "error": {"message": "division by zero", "line": 3}, "nonce": "n"}"#;
        let report = find_report(raw, "n").unwrap();
        assert_eq!(
            report.error,
            Some(ReportedError {
                message: "division by zero".to_string(),
                line: Some(3)
            })
        );
    }
}
