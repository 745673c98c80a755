//! Integration tests for the translation pipeline
//!
//! Source text goes in through the public `translate` entrypoint and either
//! Python plus a line map or a positioned error comes out.

use twibox::translate::{tokenize, ErrorReport, LexErrorKind, ParseErrorKind, TranslateError};
use twibox::{translate, Playground};

fn code(source: &str) -> String {
    translate(source)
        .unwrap_or_else(|e| panic!("{source:?} failed to translate: {e}"))
        .code
}

fn report(source: &str) -> ErrorReport {
    translate(source).expect_err("translation should fail").report()
}

#[test]
fn test_scenario_program_translates() {
    let translation = translate("x = 1 + 2; print(x)").unwrap();
    assert_eq!(translation.code, "v_x = _rt_add(1, 2)\n_rt_print(v_x)\n");
    assert_eq!(translation.line_map.len(), 2);
    assert_eq!(translation.source_line_for(2), Some(1));
}

#[test]
fn test_twi_keywords_match_english_keywords() {
    let twi = code("sɛ nokware { ka(1) } nanso { ka(atɔkyɛ) }");
    let english = code("if true { print(1) } else { print(false) }");
    assert_eq!(twi, english);
}

#[test]
fn test_twi_phrases_match_english_forms() {
    let twi = code(
        "yɛ adwuma mfiase(n) {\n  return n ka ho 1\n}\nbɔ mmirika wɔ 0..3 kyekyere i {\n  sɔ hwɛ(mfiase(i))\n}",
    );
    let english = code("fn mfiase(n) {\n  return n + 1\n}\nfor i in 0..3 {\n  print(mfiase(i))\n}");
    assert_eq!(twi, english);

    let leading = code("bɔ mmirika i wɔ 0..3 { ka(i) }");
    assert_eq!(leading, code("for i in 0..3 { print(i) }"));
}

#[test]
fn test_twi_phrases_follow_builtin_rules() {
    assert_eq!(report("x = sɔ hwɛ").message, "builtin `sɔ hwɛ` can only be called");
    assert_eq!(
        report("bɔ mmirika wɔ 0..3 { }").message,
        "expected `kyekyere`, found `{`"
    );
}

#[test]
fn test_nesting_limits_are_reported_as_parse_errors() {
    let parens = format!("x = {}1{}", "(".repeat(70), ")".repeat(70));
    let err = report(&parens);
    assert_eq!(err.kind, "parse");
    assert_eq!(err.message, "nesting is too deep");

    let blocks = format!("{}{}", "while true { ".repeat(21), "}".repeat(21));
    assert_eq!(report(&blocks).message, "nesting is too deep");

    let within = format!("{}print(1){}", "if true { ".repeat(19), " }".repeat(19));
    code(&within);
}

#[test]
fn test_translation_is_deterministic() {
    let source = "fn fib(n) {\n  if n < 2 { return n }\n  return fib(n - 1) + fib(n - 2)\n}\nfor i in 0..10 { print(fib(i)) }";
    let first = translate(source).unwrap();
    for _ in 0..5 {
        assert_eq!(translate(source).unwrap(), first);
    }
}

#[test]
fn test_host_names_are_renamed_and_builtins_are_reserved() {
    let report = report("len = 1");
    assert_eq!(report.message, "`len` is a builtin and cannot be redefined");

    let generated = code("import = 1\nexec = import\nprint(exec)");
    assert_eq!(generated, "v_import = 1\nv_exec = v_import\n_rt_print(v_exec)\n");
}

#[test]
fn test_non_ascii_names_stay_ascii_in_output() {
    let generated = code("dɛn = \"ɛte sɛn\"\nka(dɛn)");
    assert!(generated.is_ascii());
    assert!(generated.contains("w_d_x25b_n"));
}

#[test]
fn test_lex_errors_carry_position_and_kind() {
    let err = translate("x = 1\ny = @").unwrap_err();
    match &err {
        TranslateError::Lex(lex) => assert_eq!(lex.kind, LexErrorKind::UnexpectedCharacter('@')),
        other => panic!("expected a lex error, got {other:?}"),
    }
    let report = err.report();
    assert_eq!(report.kind, "lex");
    assert_eq!((report.line, report.column), (2, 5));
    assert_eq!(report.offset, 10);
}

#[test]
fn test_parse_errors_carry_position_and_kind() {
    let err = translate("while true {\n  break\n}\nbreak").unwrap_err();
    match &err {
        TranslateError::Parse(parse) => assert_eq!(parse.kind, ParseErrorKind::OutsideLoop("break")),
        other => panic!("expected a parse error, got {other:?}"),
    }
    assert_eq!(err.report().line, 4);

    let report = report("print(1, 2");
    assert_eq!(report.kind, "parse");
    assert_eq!(report.line, 1);
}

#[test]
fn test_first_error_wins() {
    // The lexer stops at the first bad character even when later input is also bad.
    let report = report("a = $\nb = \"never closed");
    assert_eq!(report.message, "unexpected character '$'");
    assert_eq!(report.line, 1);
}

#[test]
fn test_tokenize_ends_with_end_of_input() {
    let tokens = tokenize("x = 1").unwrap();
    assert!(tokens.last().is_some_and(|t| t.is_eof()));
    assert_eq!(tokens.len(), 4);
}

#[test]
fn test_empty_and_comment_only_sources_translate_to_nothing() {
    assert_eq!(code(""), "");
    assert_eq!(code("# only a comment\n\n"), "");
    assert!(translate("").unwrap().line_map.is_empty());
}

#[test]
fn test_line_map_covers_every_statement_start() {
    let source = "x = 0\n\nwhile x < 3 {\n  x += 1\n}\n\nprint(x)";
    let translation = translate(source).unwrap();
    let lines: Vec<u32> = translation.line_map.iter().map(|m| m.source_line).collect();
    assert_eq!(lines, vec![1, 3, 4, 7]);
    for pair in translation.line_map.windows(2) {
        assert!(pair[0].generated_line < pair[1].generated_line);
    }
}

#[test]
fn test_playground_translate_serializes_both_shapes() {
    let playground = Playground::default();

    let ok = serde_json::to_value(playground.translate("print(1)")).unwrap();
    assert_eq!(ok["generated_code"], "_rt_print(1)\n");
    assert!(ok.get("error").is_none());

    let err = serde_json::to_value(playground.translate("fn f( {")).unwrap();
    assert_eq!(err["error"]["kind"], "parse");
    assert!(err.get("generated_code").is_none());
}
