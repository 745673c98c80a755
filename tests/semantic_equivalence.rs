//! Translation equivalence against the reference interpreter
//!
//! Each program runs twice: in-process on the tree-walking interpreter and
//! translated under the sandbox. Both runs must print the same output and
//! end the same way, including the message and DSL line of a failure.
//! Skipped when no Python 3.8+ is installed.

use std::path::Path;
use std::process::Command;
use std::time::Duration;
use twibox::testing::reference;
use twibox::{execute, translate, ExecutionLimits, ExecutionResult, SandboxConfig};

const PYTHON: &str = "/usr/bin/python3";

const CORPUS: &[(&str, &str)] = &[
    ("arithmetic", "x = 1 + 2; print(x)\nprint(7 / 2, -7 / 2, 7 % -3, -7 % 3)\nprint(7 / 2.0, 1 + 0.5, 2 * 3.0)"),
    ("floats", "print(0.1 + 0.2, 1.0 / 3.0, 1.0e16, 1.0e15, 0.0001, 0.00001, -0.0)"),
    ("strings", "s = \"ɛte\" + \" \" + \"sɛn\"\nka(s, len(s), s[0], str(12) + \"!\")"),
    ("equality", "print(1 == 1.0, [1, [2]] == [1, [2]], 1 == \"1\", nil == false, \"a\" < \"b\")"),
    ("truthiness", "if 0 { print(\"zero\") }\nif \"\" { print(\"empty\") }\nif nil { print(\"nil\") } else { print(\"no\") }"),
    ("logic", "print(nil or 3, false and x, 1 and 2, not nil, !true)"),
    (
        "functions",
        "x = 10\nfn f(n) { y = n + x; return y }\nprint(f(1))\nprint(x)\nfn g() {}\nprint(g(), g)",
    ),
    (
        "recursion",
        "fn fib(n) {\n  if n < 2 { return n }\n  return fib(n - 1) + fib(n - 2)\n}\nfor i in 0..12 { print(fib(i)) }",
    ),
    ("lists", "a = [1]\nb = a\npush(b, 2)\nprint(a, len(a), pop(a), a)\na[0] += 5\nprint(a, type(a))"),
    (
        "loops",
        "for i in 0..5 { if i == 1 { continue } if i == 3 { break } print(i) }\nn = 0\nwhile n < 3 { n += 1 }\nprint(n)",
    ),
    ("conversions", "print(int(\" -42 \"), int(3.9), float(\"1e3\"), str([\"x\"]), abs(-4), abs(-2.5))"),
    ("types", "print(type(1), type(\"\"), type([]), type(nil), type(1 == nil), type(1.5))"),
    (
        "deep_recursion",
        "fn depth(n) { if n == 0 { return 0 } return 1 + depth(n - 1) }\nprint(depth(200))",
    ),
    (
        "recursion_limit",
        "fn depth(n) { if n == 0 { return 0 } return 1 + depth(n - 1) }\nprint(depth(300))",
    ),
    (
        "twi_phrases",
        "yɛ adwuma f(n) { return n ka ho 1 }\nbɔ mmirika wɔ 0..3 kyekyere i { sɔ hwɛ(f(i)) }",
    ),
    ("top_level_return", "print(1)\nreturn [1, \"a\", nil]\nprint(2)"),
    ("division_by_zero", "fn f(d) {\n  return 10 / d\n}\nx = 1\nprint(f(0))"),
    ("float_modulo_by_zero", "print(\"start\")\nx = 1.5 % 0.0"),
    ("undefined_variable", "print(1)\nprint(z)"),
    ("unbound_local", "fn f() {\n  print(y)\n  y = 1\n}\nf()"),
    ("overflow", "x = 9223372036854775807\nx = x + 1"),
    ("mixed_types", "print(\"ok\")\nx = 1 + \"a\""),
    ("bad_compare", "x = 1 < \"a\""),
    ("empty_pop", "xs = []\npop(xs)"),
    ("index_out_of_range", "xs = [1, 2]\nprint(xs[1])\nprint(xs[2])"),
    ("immutable_string", "s = \"ab\"\ns[0] = \"c\""),
    ("bad_int", "print(int(\"4a\"))"),
    ("self_containing_list", "a = []\npush(a, a)\nprint(len(a))\nprint(a)"),
];

fn python_available() -> bool {
    if !Path::new(PYTHON).exists() {
        println!("Skipping: {} not found", PYTHON);
        return false;
    }
    Command::new(PYTHON)
        .args(["-c", "import sys; sys.exit(0 if sys.version_info >= (3, 8) else 1)"])
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// How a run ended, in terms both sides can produce.
#[derive(Debug, PartialEq, Eq)]
enum Ending {
    Returned(Option<String>),
    Failed { message: String, line: Option<u32> },
}

fn sandboxed(source: &str) -> (String, Ending) {
    let translation = translate(source).unwrap();
    let config = SandboxConfig {
        interpreter: PYTHON.into(),
        strict_mode: false,
        ..SandboxConfig::default()
    };
    let limits = ExecutionLimits::default().with_wall_time(Duration::from_secs(10));
    match execute(&translation.code, &limits, &config) {
        ExecutionResult::Success {
            stdout, return_value, ..
        } => (stdout, Ending::Returned(return_value)),
        ExecutionResult::RuntimeFailure {
            error, line, stdout, ..
        } => (
            stdout,
            Ending::Failed {
                message: error,
                line: line.and_then(|l| translation.source_line_for(l)),
            },
        ),
        other => panic!("{source:?} did not run to an ending: {other:?}"),
    }
}

fn interpreted(source: &str) -> (String, Ending) {
    let outcome = reference::run(source).unwrap();
    let ending = match outcome.result {
        Ok(value) => Ending::Returned(value),
        Err(err) => Ending::Failed {
            message: err.message,
            line: err.line,
        },
    };
    (outcome.stdout, ending)
}

#[test]
fn test_sandbox_matches_reference_interpreter() {
    if !python_available() {
        return;
    }
    let mut mismatches = Vec::new();
    for (name, source) in CORPUS {
        let expected = interpreted(source);
        let actual = sandboxed(source);
        if expected != actual {
            mismatches.push(format!("{name}:\n  reference: {expected:?}\n  sandbox:   {actual:?}"));
        }
    }
    assert!(mismatches.is_empty(), "programs disagree:\n{}", mismatches.join("\n"));
}

#[test]
fn test_reference_corpus_covers_failures() {
    // Keeps the corpus honest: both endings must be represented.
    let endings: Vec<Ending> = CORPUS.iter().map(|(_, source)| interpreted(source).1).collect();
    assert!(endings.iter().any(|e| matches!(e, Ending::Returned(Some(_)))));
    assert!(endings.iter().filter(|e| matches!(e, Ending::Failed { .. })).count() >= 10);
    assert!(endings
        .iter()
        .all(|e| !matches!(e, Ending::Failed { line: None, .. })));
}
