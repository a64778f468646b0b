#![warn(missing_docs)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! # C Preprocessor Engine
//!
//! This library is a C/C++/Objective-C preprocessor that consumes
//! translation-unit source text and produces a fully preprocessed token
//! stream: macro definition and expansion (object-like, function-like and
//! variadic), conditional compilation, file inclusion, stringification and
//! token pasting, diagnostics, and constant-expression evaluation.
//!
//! Beyond classical preprocessing it carries a control plane: an installed
//! [`ControlListener`] can instruct the engine to leave individual
//! directives unresolved, producing partially preprocessed output. One use
//! is expanding macros only inside `#if` conditions while keeping the
//! `#if` itself in the output.
//!
//! ## Features
//!
//! - Macro expansion with argument pre-expansion, `#` and `##`
//! - Conditional compilation (`#if`, `#ifdef`, `#ifndef`, `#elif`, `#else`,
//!   `#endif`) with signed 64-bit constant expressions
//! - Include resolution over quote, system and framework search paths,
//!   `#include_next` and `#pragma once`
//! - `__LINE__`, `__FILE__`, `__COUNTER__`, `__DATE__`, `__TIME__`
//! - GCC-style linemarkers at source transitions
//! - Partial preprocessing under control-listener direction
//!
//! ## Example
//!
//! ```rust
//! use partium::{preprocess, PreprocessorConfig};
//!
//! let code = "#define PI 3.14\nfloat x = PI;\n";
//! let out = preprocess(code, &PreprocessorConfig::new()).unwrap();
//! assert!(out.contains("float x = 3.14;"));
//! ```

mod config;
mod date_time;
mod error;
mod expansion;
mod expr;
mod lexer;
mod listener;
mod macro_def;
mod numeric;
mod preprocessor;
mod source;
mod state;
mod token;
mod vfs;

pub use config::{Feature, PreprocessorConfig, Warning};
pub use error::{PreprocessError, PreprocessErrorKind};
pub use listener::{ControlListener, DiagnosticListener, IfKind, SourceChangeEvent};
pub use macro_def::{Builtin, Macro};
pub use numeric::NumericValue;
pub use preprocessor::Preprocessor;
pub use token::{Token, TokenKind, TokenValue};
pub use vfs::{DiskFileSystem, MemoryFileSystem, VirtualFile, VirtualFileSystem};

/// Pull every token out of a configured preprocessor and reconstruct the
/// output text. Checks that every conditional was balanced.
fn drain_to_string(pp: &mut Preprocessor) -> Result<String, PreprocessError> {
    let mut out = String::new();
    loop {
        let tok = pp.token()?;
        if tok.kind == TokenKind::Eof {
            break;
        }
        out.push_str(&tok.text);
    }
    if pp.conditional_depth() > 0 {
        return Err(PreprocessError::directive(
            "<end of input>".to_string(),
            0,
            "unterminated #if/#ifdef/#ifndef".to_string(),
        ));
    }
    Ok(out)
}

/// Preprocess source text with the given configuration.
///
/// # Errors
/// Returns `PreprocessError` on malformed directives, bad macro
/// invocations, unresolvable includes or unterminated conditionals.
pub fn preprocess(input: &str, config: &PreprocessorConfig) -> Result<String, PreprocessError> {
    let mut pp = Preprocessor::with_config(config);
    pp.add_input_str(input);
    drain_to_string(&mut pp)
}

/// Preprocess a file and return the result as a string.
///
/// # Errors
/// Returns `PreprocessError` if the file cannot be read or preprocessing
/// fails.
pub fn preprocess_file(path: &str, config: &PreprocessorConfig) -> Result<String, PreprocessError> {
    let mut pp = Preprocessor::with_config(config);
    pp.add_input_file(path)?;
    drain_to_string(&mut pp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn pp(src: &str) -> String {
        preprocess(src, &PreprocessorConfig::new()).unwrap()
    }

    /// Collapse all whitespace runs to single spaces for robust comparisons.
    fn norm(s: &str) -> String {
        s.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn simple_object_macro() {
        let out = pp("#define PI 3.14\nfloat x = PI;\n");
        assert!(out.contains("float x = 3.14;"));
    }

    #[test]
    fn object_macro_keeps_spelling() {
        assert_eq!(norm(&pp("#define A 1+2\nA\n")), "1+2");
    }

    #[test]
    fn function_like_macro() {
        let out = pp("#define ADD(a, b) ((a)+(b))\nint z = ADD(1, 2);\n");
        assert!(out.contains("((1)+(2))"));
    }

    #[test]
    fn argument_spelling_survives() {
        assert_eq!(norm(&pp("#define SQ(x) ((x)*(x))\nSQ(3+1)\n")), "((3+1)*(3+1))");
    }

    #[test]
    fn nested_macros() {
        let out = pp("#define ADD(a, b) ((a)+(b))\n#define MUL(a, b) ((a)*(b))\nint x = ADD(ADD(1, 2), MUL(3, 4));\n");
        assert!(out.contains("((1)+(2))"));
        assert!(out.contains("((3)*(4))"));
        assert!(out.contains("int x ="));
    }

    #[test]
    fn stringification() {
        assert_eq!(norm(&pp("#define STR(x) #x\nSTR(hello world)\n")), "\"hello world\"");
    }

    #[test]
    fn stringification_escapes_quotes() {
        let out = pp("#define STR(x) #x\nSTR(say \"hi\")\n");
        assert!(out.contains(r#""say \"hi\"""#));
    }

    #[test]
    fn token_pasting() {
        assert_eq!(norm(&pp("#define CAT(a,b) a##b\nCAT(foo,123)\n")), "foo123");
    }

    #[test]
    fn token_pasting_multiple() {
        let out = pp("#define PASTE3(a,b,c) a##b##c\nint PASTE3(_,x,_) = 42;\n");
        assert!(out.contains("_x_"));
    }

    #[test]
    fn variadic_macro() {
        assert_eq!(norm(&pp("#define V(...) f(__VA_ARGS__)\nV(1,2,3)\n")), "f(1,2,3)");
    }

    #[test]
    fn variadic_with_named_parameter() {
        let out = pp("#define LOG(fmt, ...) printf(fmt, __VA_ARGS__)\nLOG(\"hello %s\\n\", \"world\");\n");
        assert!(out.contains("printf(\"hello %s\\n\", \"world\")"));
    }

    #[test]
    fn variadic_with_zero_trailing_arguments() {
        let out = pp("#define LOG(fmt, ...) printf(fmt, __VA_ARGS__)\nLOG(\"x\")\n");
        assert_eq!(norm(&out), "printf(\"x\", )");
    }

    #[test]
    fn zero_parameter_invocation() {
        assert_eq!(norm(&pp("#define M() done\nM()\n")), "done");
    }

    #[test]
    fn function_like_without_parens_is_not_invoked() {
        let out = pp("#define F(x) expanded\nint F;\n");
        assert!(out.contains("int F;"));
    }

    #[test]
    fn self_recursion_is_painted_blue() {
        assert_eq!(norm(&pp("#define A B\n#define B A\nA B\n")), "A B");
    }

    #[test]
    fn undef_removes_macro() {
        let out = pp("#define FOO 1\n#undef FOO\nint x = FOO;\n");
        assert!(out.contains("FOO"));
    }

    #[test]
    fn conditional_ifdef() {
        let out = pp("#define DEBUG 1\n#ifdef DEBUG\nint x = 1;\n#else\nint x = 0;\n#endif\n");
        assert!(out.contains("int x = 1;"));
        assert!(!out.contains("int x = 0;"));
    }

    #[test]
    fn conditional_ifndef() {
        let out = pp("#ifndef MISSING\nint x = 1;\n#endif\n");
        assert!(out.contains("int x = 1;"));
    }

    #[test]
    fn conditional_else_branch() {
        assert_eq!(norm(&pp("#if 0\nA\n#else\nB\n#endif\n")), "B");
    }

    #[test]
    fn conditional_elif() {
        let out = pp("#define LEVEL 2\n#if LEVEL == 1\nint x = 1;\n#elif LEVEL == 2\nint x = 2;\n#else\nint x = 3;\n#endif\n");
        assert!(out.contains("int x = 2;"));
        assert!(!out.contains("int x = 1;"));
        assert!(!out.contains("int x = 3;"));
    }

    #[test]
    fn elif_after_taken_branch_stays_dead() {
        let out = pp("#if 1\nfirst\n#elif 1\nsecond\n#endif\n");
        assert!(out.contains("first"));
        assert!(!out.contains("second"));
    }

    #[test]
    fn nested_conditionals_three_deep() {
        let src = "#if 1\na\n#if 0\nb\n#if 1\nc\n#endif\n#endif\nd\n#endif\n";
        assert_eq!(norm(&pp(src)), "a d");
    }

    #[test]
    fn defined_with_and_without_parens() {
        let out = pp("#define X 1\n#if defined X && defined(X)\nyes\n#endif\n");
        assert!(out.contains("yes"));
    }

    #[test]
    fn defined_on_missing_macro() {
        let out = pp("#if defined(MISSING)\nyes\n#else\nno\n#endif\n");
        assert!(out.contains("no"));
    }

    #[test]
    fn expression_arithmetic_and_precedence() {
        let out = pp("#if 2 + 3 * 4 == 14 && (2 + 3) * 4 == 20\nint x = 1;\n#endif\n");
        assert!(out.contains("int x = 1;"));
    }

    #[test]
    fn expression_operators() {
        let src = "#if (1<<3) == 8 && (16>>2) == 4 && (10/3) == 3 && (7%4) == 3 && (~0) == -1 && !0 && (5>4) && (4>=4) && (3!=4) && (3<4) && (4<=4) && (6&3) == 2 && (6|3) == 7 && (6^3) == 5\nyes\n#endif\n";
        assert!(pp(src).contains("yes"));
    }

    #[test]
    fn expression_ternary() {
        let out = pp("#if (0 ? 10 : 20) == 20\nyes\n#endif\n");
        assert!(out.contains("yes"));
    }

    #[test]
    fn expression_character_literal() {
        let out = pp("#if 'A' == 65\nyes\n#endif\n");
        assert!(out.contains("yes"));
    }

    #[test]
    fn expression_radix_literals() {
        let out = pp("#if 0x10 == 16 && 010 == 8\nyes\n#endif\n");
        assert!(out.contains("yes"));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        assert!(preprocess("#if 1/0\n#endif\n", &PreprocessorConfig::new()).is_err());
    }

    #[test]
    fn logical_and_does_not_short_circuit() {
        // Both sides are always evaluated, so the dead division still
        // diagnoses.
        assert!(preprocess("#if 0 && 1/0\n#endif\n", &PreprocessorConfig::new()).is_err());
    }

    #[test]
    fn unterminated_conditional_is_an_error() {
        assert!(preprocess("#if 1\nint x;\n", &PreprocessorConfig::new()).is_err());
    }

    #[test]
    fn error_directive_in_dead_branch_is_silent() {
        let out = pp("#if 0\n#error never\n#endif\nok\n");
        assert!(out.contains("ok"));
    }

    #[test]
    fn error_directive_fails_without_listener() {
        assert!(preprocess("#error bad\n", &PreprocessorConfig::new()).is_err());
    }

    #[test]
    fn errors_render_the_offending_line_with_a_caret() {
        let err = preprocess("int x;\n#error broken\n", &PreprocessorConfig::new()).unwrap_err();
        assert_eq!(err.source_line.as_deref(), Some("#error broken"));
        let rendered = err.to_string();
        assert!(rendered.contains("\n#error broken\n"));
        assert!(rendered.ends_with(" ^"));
    }

    #[test]
    fn comments_collapse_to_whitespace() {
        let out = pp("int a /* gap */ = 1; // tail\n");
        assert!(out.contains("int a"));
        assert!(!out.contains("gap"));
        assert!(!out.contains("tail"));
    }

    #[test]
    fn keep_comments_feature() {
        let config = PreprocessorConfig::new().with_feature(Feature::KeepComments);
        let out = preprocess("int a /* gap */ = 1;\n", &config).unwrap();
        assert!(out.contains("/* gap */"));
    }

    #[test]
    fn dynamic_macros() {
        let out = pp("int line = __LINE__;\nconst char* f = __FILE__;\n");
        assert!(out.contains("int line = 1;"));
        assert!(out.contains("\"<no file>\""));
    }

    #[test]
    fn counter_increments() {
        assert_eq!(norm(&pp("__COUNTER__ __COUNTER__ __COUNTER__\n")), "0 1 2");
    }

    #[test]
    fn date_and_time_shapes() {
        let out = pp("__DATE__ __TIME__\n");
        // "Mmm dd yyyy" and "hh:mm:ss", both quoted.
        assert_eq!(out.matches('"').count(), 4);
        assert!(out.contains(':'));
    }

    #[test]
    fn line_directive_is_discarded() {
        let out = pp("#line 100 \"other.c\"\nint x;\n");
        assert!(out.contains("int x;"));
        assert!(!out.contains("#line"));
    }

    fn memory_fs(files: &[(&str, &str)]) -> Rc<MemoryFileSystem> {
        let fs = MemoryFileSystem::new();
        for (path, contents) in files {
            fs.add_file(*path, *contents);
        }
        Rc::new(fs)
    }

    fn drain(pp: &mut Preprocessor) -> String {
        let mut out = String::new();
        loop {
            let tok = pp.token().unwrap();
            if tok.kind == TokenKind::Eof {
                break;
            }
            out.push_str(&tok.text);
        }
        out
    }

    #[test]
    fn include_from_system_path() {
        let fs = memory_fs(&[("inc/foo.h", "#define FOO 42\n")]);
        let mut pp = Preprocessor::new();
        pp.set_file_system(fs);
        pp.set_system_include_path(vec!["inc".to_string()]);
        pp.add_input_str("#include <foo.h>\nint x = FOO;\n");
        assert!(drain(&mut pp).contains("int x = 42;"));
    }

    #[test]
    fn quoted_include_relative_to_including_file() {
        let fs = memory_fs(&[
            ("src/main.c", "#include \"util.h\"\nUTIL\n"),
            ("src/util.h", "#define UTIL ok\n"),
        ]);
        let mut pp = Preprocessor::new();
        pp.set_file_system(fs);
        pp.add_input_file("src/main.c").unwrap();
        assert!(drain(&mut pp).contains("ok"));
        assert_eq!(pp.includes(), ["src/util.h"]);
    }

    #[test]
    fn include_via_macro_spelled_header() {
        let fs = memory_fs(&[("x.h", "int q;\n")]);
        let mut pp = Preprocessor::new();
        pp.set_file_system(fs);
        pp.set_quote_include_path(vec![".".to_string()]);
        pp.add_input_str("#define HDR \"x.h\"\n#include HDR\n");
        assert!(drain(&mut pp).contains("int q;"));
    }

    #[test]
    fn absolute_include() {
        let fs = memory_fs(&[("/usr/include/abs.h", "int a;\n")]);
        let mut pp = Preprocessor::new();
        pp.set_file_system(fs);
        pp.add_input_str("#include </usr/include/abs.h>\n");
        assert!(drain(&mut pp).contains("int a;"));
    }

    #[test]
    fn framework_include() {
        let fs = memory_fs(&[(
            "fw/Cocoa.framework/Headers/Cocoa.h",
            "int cocoa;\n",
        )]);
        let mut pp = Preprocessor::new();
        pp.set_file_system(fs);
        pp.set_frameworks_path(vec!["fw".to_string()]);
        pp.add_input_str("#include <Cocoa/Cocoa.h>\n");
        assert!(drain(&mut pp).contains("int cocoa;"));
    }

    #[test]
    fn include_not_found_reports_search() {
        let err = preprocess("#include \"missing.h\"\n", &PreprocessorConfig::new()).unwrap_err();
        assert!(matches!(err.kind, PreprocessErrorKind::IncludeNotFound(_)));
        assert!(err.to_string().contains("missing.h"));
    }

    #[test]
    fn pragma_once_includes_only_once() {
        let fs = memory_fs(&[("header.h", "#pragma once\nint x = 42;\n")]);
        let mut pp = Preprocessor::new();
        pp.add_feature(Feature::PragmaOnce);
        pp.set_file_system(fs);
        pp.set_system_include_path(vec![".".to_string()]);
        pp.add_input_str("#include <header.h>\n#include <header.h>\nint y = x;\n");
        let out = drain(&mut pp);
        assert_eq!(out.matches("int x = 42;").count(), 1);
        assert!(out.contains("int y = x;"));
    }

    #[test]
    fn include_next_skips_earlier_directories() {
        let fs = memory_fs(&[
            ("sys1/wrap.h", "#include_next <wrap.h>\nint first;\n"),
            ("sys2/wrap.h", "int second;\n"),
        ]);
        let mut pp = Preprocessor::new();
        pp.add_feature(Feature::IncludeNext);
        pp.set_file_system(fs);
        pp.set_system_include_path(vec!["sys1".to_string(), "sys2".to_string()]);
        pp.add_input_str("#include <wrap.h>\n");
        let out = drain(&mut pp);
        assert!(out.contains("int second;"));
        assert!(out.contains("int first;"));
    }

    #[test]
    fn include_next_requires_the_feature() {
        let err =
            preprocess("#include_next <x.h>\n", &PreprocessorConfig::new()).unwrap_err();
        assert!(err.to_string().contains("include_next"));
    }

    #[test]
    fn linemarkers_at_source_transitions() {
        let fs = memory_fs(&[("a.h", "int a;\n")]);
        let mut pp = Preprocessor::new();
        pp.add_feature(Feature::Linemarkers);
        pp.set_file_system(fs);
        pp.set_quote_include_path(vec![".".to_string()]);
        pp.add_input_str("#include \"a.h\"\nint b;\n");
        let out = drain(&mut pp);
        assert!(out.contains("#line 1 \"a.h\" 1\n"));
        assert!(out.contains("\"<no file>\" 2\n"));
        assert!(out.contains("int a;"));
        assert!(out.contains("int b;"));
    }

    /// A diagnostic listener that records everything and lets processing
    /// continue.
    #[derive(Default)]
    struct Recorder {
        errors: RefCell<Vec<String>>,
        warnings: RefCell<Vec<String>>,
        defines: RefCell<Vec<String>>,
        includes: RefCell<Vec<String>>,
    }

    impl DiagnosticListener for Recorder {
        fn handle_error(&self, _source: Option<&str>, _line: u32, _column: u32, msg: &str) {
            self.errors.borrow_mut().push(msg.to_string());
        }
        fn handle_warning(&self, _source: Option<&str>, _line: u32, _column: u32, msg: &str) {
            self.warnings.borrow_mut().push(msg.to_string());
        }
        fn handle_define(&self, m: &Macro, _source: Option<&str>) {
            self.defines.borrow_mut().push(m.name().to_string());
        }
        fn handle_include(&self, text: &str, _next: bool, _from: Option<&str>, _to: Option<&str>) {
            self.includes.borrow_mut().push(text.to_string());
        }
    }

    #[test]
    fn listener_keeps_processing_after_errors() {
        let recorder = Rc::new(Recorder::default());
        let mut pp = Preprocessor::new();
        pp.set_listener(recorder.clone());
        pp.add_input_str("#endif\nok\n");
        let out = drain(&mut pp);
        assert!(out.contains("ok"));
        assert_eq!(recorder.errors.borrow().len(), 1);
        assert!(recorder.errors.borrow()[0].contains("#endif without #if"));
    }

    #[test]
    fn listener_observes_defines_and_includes() {
        let fs = memory_fs(&[("h.h", "int h;\n")]);
        let recorder = Rc::new(Recorder::default());
        let mut pp = Preprocessor::new();
        pp.set_listener(recorder.clone());
        pp.set_file_system(fs);
        pp.set_system_include_path(vec![".".to_string()]);
        pp.add_input_str("#define A 1\n#include <h.h>\n");
        drain(&mut pp);
        assert_eq!(recorder.defines.borrow().as_slice(), ["A"]);
        assert_eq!(recorder.includes.borrow().as_slice(), ["<h.h>"]);
    }

    #[test]
    fn undef_warning_in_conditionals() {
        let recorder = Rc::new(Recorder::default());
        let mut pp = Preprocessor::new();
        pp.add_warning(Warning::Undef);
        pp.set_listener(recorder.clone());
        pp.add_input_str("#if MISSING\n#endif\n");
        drain(&mut pp);
        assert_eq!(recorder.warnings.borrow().len(), 1);
        assert!(recorder.warnings.borrow()[0].contains("MISSING"));
    }

    #[test]
    fn endif_labels_warning() {
        let recorder = Rc::new(Recorder::default());
        let mut pp = Preprocessor::new();
        pp.add_warning(Warning::EndifLabels);
        pp.set_listener(recorder.clone());
        pp.add_input_str("#if 1\n#endif LABEL\n");
        drain(&mut pp);
        assert_eq!(recorder.warnings.borrow().len(), 1);
        assert!(recorder.warnings.borrow()[0].contains("LABEL"));
    }

    #[test]
    fn warnings_escalate_with_error_flag() {
        let mut pp = Preprocessor::new();
        pp.add_warning(Warning::Error);
        let recorder = Rc::new(Recorder::default());
        pp.set_listener(recorder.clone());
        pp.add_input_str("#pragma whatever\n");
        drain(&mut pp);
        assert_eq!(recorder.errors.borrow().len(), 1);
        assert!(recorder.warnings.borrow().is_empty());
    }

    /// Decline every conditional so the directives survive into the output.
    struct KeepConditionals;

    impl ControlListener for KeepConditionals {
        fn process_if(&self, _tokens: &[Token], _source: Option<&str>, _kind: IfKind) -> bool {
            false
        }
    }

    #[test]
    fn declined_conditionals_are_preserved() {
        let mut pp = Preprocessor::new();
        pp.set_control_listener(Rc::new(KeepConditionals));
        pp.add_input_str("#if 0\nA\n#else\nB\n#endif\n");
        let out = drain(&mut pp);
        assert_eq!(norm(&out), "#if 0 A #else B #endif");
        // The nesting was still tracked to balance.
        assert_eq!(pp.conditional_depth(), 0);
    }

    #[test]
    fn declined_ifdef_is_preserved_and_both_branches_flow() {
        let mut pp = Preprocessor::new();
        pp.set_control_listener(Rc::new(KeepConditionals));
        pp.add_input_str("#ifdef FEATURE\nA\n#endif\n");
        let out = drain(&mut pp);
        assert_eq!(norm(&out), "#ifdef FEATURE A #endif");
    }

    /// Keep conditionals in the output but expand macros inside their
    /// conditions.
    struct ExpandInConditions;

    impl ControlListener for ExpandInConditions {
        fn process_if(&self, _tokens: &[Token], _source: Option<&str>, _kind: IfKind) -> bool {
            false
        }

        fn partially_processed_condition(
            &self,
            condition: &[Token],
            _source: Option<&str>,
            _kind: IfKind,
            pp: &mut Preprocessor,
        ) -> Option<String> {
            let spelled: String = condition.iter().map(|t| t.text.as_str()).collect();
            let expanded = pp.expand(&spelled).ok()?;
            Some(expanded.iter().map(|t| t.text.as_str()).collect())
        }
    }

    #[test]
    fn condition_rewriting_expands_macros_in_place() {
        let mut pp = Preprocessor::new();
        pp.set_control_listener(Rc::new(ExpandInConditions));
        pp.add_input_str("#define N 2\n#if N > 1\nA\n#endif\n");
        let out = drain(&mut pp);
        assert!(out.contains("#if 2 > 1"));
        assert!(out.contains("A"));
        assert!(out.contains("#endif"));
    }

    /// Decline defines, undefs and includes so they stay in the output.
    struct KeepDirectives;

    impl ControlListener for KeepDirectives {
        fn add_macro(&self, _m: &Macro, _source: Option<&str>) -> bool {
            false
        }
        fn remove_macro(&self, _m: &Macro, _source: Option<&str>) -> bool {
            false
        }
        fn include(
            &self,
            _source: Option<&str>,
            _line: u32,
            _name: &str,
            _quoted: bool,
            _next: bool,
        ) -> bool {
            false
        }
    }

    #[test]
    fn declined_defines_and_includes_are_preserved() {
        let mut pp = Preprocessor::new();
        pp.set_control_listener(Rc::new(KeepDirectives));
        pp.add_input_str("#define FOO 1\nFOO\n#undef FOO\n#include \"x.h\"\n");
        let out = drain(&mut pp);
        assert!(out.contains("#define FOO 1"));
        assert!(out.contains("#undef FOO"));
        assert!(out.contains("#include \"x.h\""));
        // The macro was never added, so the use stays unexpanded.
        assert!(out.contains("\nFOO\n"));
    }

    /// Suppress expansion of one macro by name.
    struct NoExpand(&'static str);

    impl ControlListener for NoExpand {
        fn expand_macro(
            &self,
            m: &Macro,
            _source: Option<&str>,
            _line: u32,
            _column: u32,
            _in_conditional: bool,
        ) -> bool {
            m.name() != self.0
        }
    }

    #[test]
    fn expansion_can_be_suppressed_per_macro() {
        let mut pp = Preprocessor::new();
        pp.set_control_listener(Rc::new(NoExpand("KEEP")));
        pp.add_input_str("#define KEEP 1\n#define GO 2\nKEEP GO\n");
        assert_eq!(norm(&drain(&mut pp)), "KEEP 2");
    }

    #[test]
    fn api_defined_macros() {
        let mut pp = Preprocessor::new();
        pp.define("VERSION", "3");
        pp.define_flag("ENABLED");
        pp.add_input_str("#if ENABLED\nint v = VERSION;\n#endif\n");
        assert!(drain(&mut pp).contains("int v = 3;"));
        assert!(pp.is_defined("VERSION"));
        pp.undef("VERSION");
        assert!(!pp.is_defined("VERSION"));
    }

    #[test]
    fn expand_api_expands_against_current_table() {
        let mut pp = Preprocessor::new();
        pp.define("TWO", "2");
        let tokens = pp.expand("TWO + TWO").unwrap();
        let text: String = tokens.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(text, "2 + 2");
    }

    #[test]
    fn multiple_inputs_in_order() {
        let mut pp = Preprocessor::new();
        pp.add_input_str("#define A first\n");
        pp.add_input_str("A\n");
        assert_eq!(norm(&drain(&mut pp)), "first");
    }

    #[test]
    fn line_continuation_in_define() {
        let out = pp("#define LONG a \\\n  b\nLONG\n");
        assert!(out.contains("a"));
        assert!(out.contains("b"));
        assert!(!out.contains("LONG"));
    }

    #[test]
    fn hash_not_at_line_start_is_plain_text() {
        let out = pp("int a = 1; # not a directive\n");
        // Nothing to dispatch: the hash is mid-line.
        assert!(out.contains("# not a directive"));
    }

    #[test]
    fn null_directive_is_accepted() {
        let out = pp("#\nint x;\n");
        assert!(out.contains("int x;"));
    }

    #[test]
    fn defined_cannot_be_defined() {
        assert!(preprocess("#define defined 1\n", &PreprocessorConfig::new()).is_err());
    }

    #[test]
    fn conditional_tokens_capture_the_directive_line() {
        let mut pp = Preprocessor::new();
        pp.add_input_str("#if 1\n");
        loop {
            let tok = pp.token().unwrap();
            if tok.kind == TokenKind::Eof {
                break;
            }
        }
        assert_eq!(pp.conditional_depth(), 1);
        let spelled: String = pp.conditional_tokens().iter().map(|t| t.text.as_str()).collect();
        assert_eq!(spelled, "if 1");
    }
}
