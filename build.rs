use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories holding the crate's Rust sources.
const SOURCE_ROOTS: [&str; 7] = ["reml", "data", "predict", "shared", "src", "tests", "benches"];

// Collects every matching line of one file so a single error lists them all.
struct LineCollector {
    violations: Vec<String>,
    file_path: PathBuf,
    filter: fn(&str) -> bool,
}

impl LineCollector {
    fn new(file_path: &Path, filter: fn(&str) -> bool) -> Self {
        Self {
            violations: Vec::new(),
            file_path: file_path.to_path_buf(),
            filter,
        }
    }

    fn error_message(&self, what: &str, advice: &str) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }
        let mut msg = format!(
            "\n❌ ERROR: Found {} {what} in {}:\n",
            self.violations.len(),
            self.file_path.display()
        );
        for violation in &self.violations {
            msg.push_str(&format!("   {violation}\n"));
        }
        msg.push_str(&format!("\n⚠️ {advice}\n"));
        Some(msg)
    }
}

impl Sink for LineCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if (self.filter)(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

struct Rule {
    pattern: &'static str,
    filter: fn(&str) -> bool,
    what: &'static str,
    advice: &'static str,
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for root in SOURCE_ROOTS {
        println!("cargo:rerun-if-changed={root}");
    }

    let rules = [
        Rule {
            pattern: r"\b(_[a-zA-Z0-9_]+)\b",
            filter: is_code_binding,
            what: "underscore-prefixed variables",
            advice: "Underscore-prefixed names are not allowed; use the value or remove it.",
        },
        Rule {
            pattern: r"(//|/\*).*(?:FIXED|CORRECTED|FIX|NEW|CHANGED|CHANGE|MODIFIED|UPDATED|UPDATE)",
            filter: accept,
            what: "changelog-style comments",
            advice: "Comments describe the code as it is, not how it came to be.",
        },
        Rule {
            pattern: r"(//|/\*).*",
            filter: is_all_caps_comment,
            what: "all-uppercase comments",
            advice: "Comments where every letter is uppercase are not allowed.",
        },
        Rule {
            pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
            filter: accept,
            what: "#[allow(dead_code)] attributes",
            advice: "Use the code or remove it instead of silencing the lint.",
        },
    ];

    if let Err(e) = scan(&rules) {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

fn scan(rules: &[Rule]) -> Result<(), Box<dyn Error>> {
    let mut searcher = Searcher::new();
    for rule in rules {
        let matcher = RegexMatcher::new_line_matcher(rule.pattern)?;
        for root in SOURCE_ROOTS {
            for entry in WalkDir::new(root)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
            {
                let mut collector = LineCollector::new(entry.path(), rule.filter);
                searcher.search_path(&matcher, entry.path(), &mut collector)?;
                if let Some(msg) = collector.error_message(rule.what, rule.advice) {
                    return Err(msg.into());
                }
            }
        }
    }
    Ok(())
}

fn accept(_: &str) -> bool {
    true
}

// Skips comments and matches that sit inside string literals.
fn is_code_binding(line: &str) -> bool {
    if line.trim_start().starts_with("//") {
        return false;
    }
    !line
        .split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'))
}

fn is_all_caps_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    let comment = if let Some(rest) = trimmed.strip_prefix("///") {
        rest
    } else if let Some(rest) = trimmed.strip_prefix("//!") {
        rest
    } else if let Some(rest) = trimmed.strip_prefix("//") {
        rest
    } else {
        return false;
    };
    let letters: Vec<char> = comment.chars().filter(|c| c.is_alphabetic()).collect();
    !letters.is_empty() && letters.iter().all(|c| c.is_uppercase())
}
