//! Sandboxed interpreter for LM-generated programs.
//!
//! The sandbox is an allow-list evaluator over a tiny AST rather than a
//! restricted general-purpose runtime: anything the parser and evaluator do
//! not explicitly implement cannot be reached. Programs see `context`,
//! `memory`, `llm_query`, `FINAL`, and a fixed set of pure builtins; imports,
//! I/O, reflection, and unknown names are sandbox violations.

mod ast;
mod interp;
mod lexer;
mod parser;
mod value;

use std::sync::Arc;
use std::time::Instant;

use crate::deadline::Deadline;
use crate::error::Error;
use crate::MemoryMap;

pub use ast::Program;
pub use interp::{Interpreter, LlmQueryFn, SandboxRun};
pub use parser::{parse, STRING_METHODS};
pub use value::{Builtin, Value};

/// Outcome of one sandbox execution.
#[derive(Debug)]
pub enum Outcome {
    /// The program called `FINAL(value)`.
    Final(String),
    /// The program was rejected or raised; includes a completed run that
    /// never called FINAL.
    Error(Error),
    /// The wall-clock deadline expired mid-program.
    Timeout,
}

/// Parse and execute one program under the documented environment.
///
/// Parse failures surface as an `Error` outcome with the pre-execution
/// memory untouched.
pub fn run_program(
    source: &str,
    context: String,
    memory: MemoryMap,
    llm_query: LlmQueryFn<'_>,
    deadline: Arc<Deadline>,
    node_cap: Instant,
) -> SandboxRun {
    let program = match parse(source) {
        Ok(program) => program,
        Err(err) => {
            return SandboxRun {
                outcome: Outcome::Error(err),
                memory_after: memory,
            };
        }
    };

    Interpreter::new(context, memory, llm_query, deadline, node_cap).run(&program)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn run(source: &str, context: &str) -> SandboxRun {
        run_with_memory(source, context, BTreeMap::new())
    }

    fn run_with_memory(source: &str, context: &str, memory: MemoryMap) -> SandboxRun {
        let deadline = Arc::new(Deadline::after(Duration::from_secs(30)));
        run_program(
            source,
            context.to_string(),
            memory,
            Box::new(|prompt, _memory| Ok(format!("echo:{}", prompt))),
            deadline,
            Instant::now() + Duration::from_secs(30),
        )
    }

    fn expect_final(run: SandboxRun) -> String {
        match run.outcome {
            Outcome::Final(result) => result,
            other => panic!("expected FINAL, got {:?}", other),
        }
    }

    fn expect_error(run: SandboxRun) -> Error {
        match run.outcome {
            Outcome::Error(err) => err,
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_trivial_final() {
        let result = expect_final(run("FINAL(context)\n", "abc"));
        assert_eq!(result, "abc");
    }

    #[test]
    fn test_arithmetic_and_string_ops() {
        let source = r#"
total = 0
for i in range(5):
    total += i
half = 7 // 2
frac = 7 / 2
label = "n=" + str(total) + " h=" + str(half) + " f=" + str(frac)
FINAL(label)
"#;
        assert_eq!(expect_final(run(source, "")), "n=10 h=3 f=3.5");
    }

    #[test]
    fn test_chunked_map_over_context() {
        let context = "x".repeat(120);
        let source = r#"
chunks = []
size = 50
count = (len(context) + size - 1) // size
for i in range(count):
    chunks = chunks + [context[i * size:(i + 1) * size]]
parts = []
for chunk in chunks:
    parts = parts + [llm_query("summarize: " + str(len(chunk)))]
FINAL("\n---\n".join(parts))
"#;
        let result = expect_final(run(source, &context));
        assert_eq!(
            result,
            "echo:summarize: 50\n---\necho:summarize: 50\n---\necho:summarize: 20"
        );
    }

    #[test]
    fn test_memory_mutation_propagates() {
        let mut memory = BTreeMap::new();
        memory.insert("seen".to_string(), serde_json::json!(1));
        let source = r#"
memory["seen"] = memory["seen"] + 1
memory["note"] = "hello"
FINAL(str(memory["seen"]))
"#;
        let run = run_with_memory(source, "", memory);
        assert_eq!(run.memory_after.get("seen"), Some(&serde_json::json!(2)));
        assert_eq!(
            run.memory_after.get("note"),
            Some(&serde_json::json!("hello"))
        );
        assert_eq!(expect_final(run), "2");
    }

    #[test]
    fn test_import_is_sandbox_violation_naming_module() {
        let err = expect_error(run("import os; FINAL(os.getcwd())\n", ""));
        assert_eq!(err.kind(), ErrorKind::SandboxViolation);
        assert!(err.to_string().contains("os"));
    }

    #[test]
    fn test_unknown_name_is_sandbox_violation() {
        let err = expect_error(run("FINAL(open('x'))\n", ""));
        assert_eq!(err.kind(), ErrorKind::SandboxViolation);
        assert!(err.to_string().contains("'open'"));
    }

    #[test]
    fn test_no_final_is_error() {
        let err = expect_error(run("x = 1 + 1\n", ""));
        assert_eq!(err.kind(), ErrorKind::NoFinal);
        assert!(err.to_string().contains("terminated without FINAL"));
    }

    #[test]
    fn test_division_by_zero_is_runtime_error() {
        let err = expect_error(run("FINAL(1 / 0)\n", ""));
        assert_eq!(err.kind(), ErrorKind::ProgramRuntime);
        assert!(err.to_string().contains("division by zero"));
    }

    #[test]
    fn test_index_out_of_range_is_runtime_error() {
        let err = expect_error(run("items = [1, 2]\nFINAL(items[5])\n", ""));
        assert_eq!(err.kind(), ErrorKind::ProgramRuntime);
    }

    #[test]
    fn test_spinning_loop_times_out() {
        let deadline = Arc::new(Deadline::after(Duration::from_millis(50)));
        let source = r#"
x = 0
for i in range(1000000):
    for j in range(1000000):
        x = x + 1
FINAL(x)
"#;
        let run = run_program(
            source,
            String::new(),
            BTreeMap::new(),
            Box::new(|_, _| Ok(String::new())),
            deadline,
            Instant::now() + Duration::from_secs(30),
        );
        assert!(matches!(run.outcome, Outcome::Timeout));
    }

    #[test]
    fn test_node_cap_times_out() {
        let deadline = Arc::new(Deadline::after(Duration::from_secs(300)));
        let run = run_program(
            "for i in range(1000000):\n    x = i\nFINAL(x)\n",
            String::new(),
            BTreeMap::new(),
            Box::new(|_, _| Ok(String::new())),
            deadline,
            Instant::now(),
        );
        assert!(matches!(run.outcome, Outcome::Timeout));
    }

    #[test]
    fn test_llm_query_error_aborts_program() {
        let deadline = Arc::new(Deadline::after(Duration::from_secs(30)));
        let run = run_program(
            "answer = llm_query('q')\nFINAL(answer)\n",
            String::new(),
            BTreeMap::new(),
            Box::new(|_, _| Err(Error::recursion_limit(10))),
            deadline,
            Instant::now() + Duration::from_secs(30),
        );
        let err = expect_error(run);
        assert_eq!(err.kind(), ErrorKind::RecursionLimit);
    }

    #[test]
    fn test_user_function_and_conditionals() {
        let source = r#"
def classify(n):
    if n < 0:
        return "neg"
    elif n == 0:
        return "zero"
    else:
        return "pos"

labels = []
for n in [-2, 0, 5]:
    labels = labels + [classify(n)]
FINAL(",".join(labels))
"#;
        assert_eq!(expect_final(run(source, "")), "neg,zero,pos");
    }

    #[test]
    fn test_string_methods() {
        let source = r#"
words = "  Alpha,Beta,Gamma  ".strip().split(",")
found = []
for word in words:
    if word.lower().startswith("b"):
        found = found + [word.upper()]
FINAL("|".join(found))
"#;
        assert_eq!(expect_final(run(source, "")), "BETA");
    }

    #[test]
    fn test_runaway_recursion_is_bounded() {
        let source = r#"
def loop(n):
    return loop(n + 1)
FINAL(loop(0))
"#;
        let err = expect_error(run(source, ""));
        assert_eq!(err.kind(), ErrorKind::ProgramRuntime);
        assert!(err.to_string().contains("call depth"));
    }

    #[test]
    fn test_final_stringifies_containers() {
        let result = expect_final(run("FINAL({'k': [1, 2]})\n", ""));
        assert_eq!(result, "{\"k\":[1,2]}");
    }

    #[test]
    fn test_parse_error_leaves_memory_untouched() {
        let mut memory = BTreeMap::new();
        memory.insert("k".to_string(), serde_json::json!("v"));
        let run = run_with_memory("while True:\n    pass\n", "", memory.clone());
        assert!(matches!(run.outcome, Outcome::Error(_)));
        assert_eq!(run.memory_after, memory);
    }

    #[test]
    fn test_enumerate_unpacking() {
        let source = r#"
out = []
for i, name in enumerate(["a", "b"]):
    out = out + [str(i) + ":" + name]
FINAL(",".join(out))
"#;
        assert_eq!(expect_final(run(source, "")), "0:a,1:b");
    }

    #[test]
    fn test_membership_and_sorted() {
        let source = r#"
nums = sorted([3, 1, 2])
ok = 2 in nums and 9 not in nums and "bc" in "abcd"
if ok:
    FINAL(str(nums[0]) + str(nums[1]) + str(nums[2]))
FINAL("unreachable")
"#;
        assert_eq!(expect_final(run(source, "")), "123");
    }

    #[test]
    fn test_negative_indices_and_slices() {
        let source = r#"
s = "abcdef"
FINAL(s[-1] + s[1:3] + s[:2] + s[4:])
"#;
        assert_eq!(expect_final(run(source, "")), "fbcabef");
    }
}
