use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Source trees that make up the crate. Vendored or reference material elsewhere
// in the checkout is never scanned.
const SOURCE_DIRS: [&str; 4] = ["severity", "cli", "tests", "benches"];

const FORBIDDEN_MARKERS: [&str; 14] = [
    "FIXED", "CORRECTED", "FIXES", "FIX", "NEW", "CHANGED", "CHANGES", "CHANGE", "MODIFIED",
    "MODIFIES", "MODIFY", "UPDATED", "UPDATES", "UPDATE",
];

/// A source policy: a line regex plus a filter deciding which matching lines
/// are real violations.
struct Rule {
    name: &'static str,
    pattern: String,
    is_violation: fn(&str) -> bool,
    advice: &'static str,
}

// Collects the violating lines of a single file.
struct LineCollector<'a> {
    rule: &'a Rule,
    violations: Vec<String>,
}

impl Sink for LineCollector<'_> {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if (self.rule.is_violation)(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn comment_start(line: &str) -> Option<usize> {
    let mut in_string = false;
    let bytes = line.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if in_string => i += 1,
            b'"' => in_string = !in_string,
            b'/' if !in_string && bytes.get(i + 1) == Some(&b'/') => return Some(i),
            _ => {}
        }
        i += 1;
    }
    None
}

fn comment_text(line: &str) -> Option<&str> {
    comment_start(line).map(|start| line[start..].trim_start_matches(['/', '!']).trim())
}

fn is_outer_doc_comment(line: &str) -> bool {
    line.trim_start().starts_with("///")
}

/// The line with string literals and the trailing comment blanked out.
fn code_only(line: &str) -> String {
    let code = match comment_start(line) {
        Some(start) => &line[..start],
        None => line,
    };
    let mut out = String::with_capacity(code.len());
    let mut in_string = false;
    let mut escaped = false;
    for c in code.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
                out.push(c);
            }
            continue;
        }
        if c == '"' {
            in_string = true;
        }
        out.push(c);
    }
    out
}

fn has_underscore_binding(line: &str) -> bool {
    let code = code_only(line);
    let bytes = code.as_bytes();
    bytes.iter().enumerate().any(|(i, &b)| {
        let starts_word = i == 0 || !(bytes[i - 1].is_ascii_alphanumeric() || bytes[i - 1] == b'_');
        let followed = bytes
            .get(i + 1)
            .is_some_and(|n| n.is_ascii_alphanumeric() || *n == b'_');
        b == b'_' && starts_word && followed
    })
}

fn has_forbidden_marker(line: &str) -> bool {
    comment_text(line).is_some_and(|text| FORBIDDEN_MARKERS.iter().any(|m| text.contains(m)))
}

fn has_stars_outside_doc_comment(line: &str) -> bool {
    !is_outer_doc_comment(line) && comment_text(line).is_some_and(|text| text.contains("**"))
}

fn is_all_caps_comment(line: &str) -> bool {
    comment_text(line).is_some_and(|text| {
        let mut letters = text.chars().filter(|c| c.is_alphabetic()).peekable();
        letters.peek().is_some() && letters.all(|c| c.is_uppercase())
    })
}

fn rules() -> Vec<Rule> {
    vec![
        Rule {
            name: "underscore-prefixed identifiers",
            pattern: r"\b_[a-zA-Z0-9_]+\b".to_string(),
            is_violation: has_underscore_binding,
            advice: "Either use the binding (dropping the underscore) or remove it.",
        },
        Rule {
            name: "forbidden comment markers",
            pattern: format!(r"//.*(?:{})", FORBIDDEN_MARKERS.join("|")),
            is_violation: has_forbidden_marker,
            advice: "Comments describe the code as it is, not its edit history.",
        },
        Rule {
            name: "'**' in non-doc comments",
            pattern: r"//.*\*\*".to_string(),
            is_violation: has_stars_outside_doc_comment,
            advice: "Markdown emphasis belongs in /// doc comments only.",
        },
        Rule {
            name: "all-uppercase comments",
            pattern: r"//.*[A-Z]".to_string(),
            is_violation: is_all_caps_comment,
            advice: "Rewrite the comment in normal case or delete it.",
        },
        Rule {
            name: "#[allow(dead_code)] attributes",
            pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
            is_violation: |_| true,
            advice: "Use the code or remove it.",
        },
    ]
}

fn source_files() -> Vec<PathBuf> {
    SOURCE_DIRS
        .iter()
        .filter(|dir| Path::new(dir).is_dir())
        .flat_map(|dir| WalkDir::new(dir).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
        .collect()
}

fn check_sources() -> Result<(), Box<dyn Error>> {
    let files = source_files();
    let mut searcher = Searcher::new();
    for rule in rules() {
        let matcher = RegexMatcher::new_line_matcher(&rule.pattern)?;
        for path in &files {
            let mut collector = LineCollector {
                rule: &rule,
                violations: Vec::new(),
            };
            searcher.search_path(&matcher, path, &mut collector)?;
            if !collector.violations.is_empty() {
                let mut message = format!(
                    "\n❌ ERROR: Found {} {} in {}:\n",
                    collector.violations.len(),
                    rule.name,
                    path.display()
                );
                for violation in &collector.violations {
                    message.push_str(&format!("   {violation}\n"));
                }
                message.push_str(&format!("\n⚠️ {}\n", rule.advice));
                return Err(message.into());
            }
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    if let Err(e) = check_sources() {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
