//! Interactive prompt seam
//!
//! All operator interaction goes through the [`Prompt`] trait so the
//! provisioning logic can be driven by scripted answers in tests.

use std::io::{self, Write};

use color_eyre::eyre::{Context, Result};

/// Operator interaction used by the provisioning workflow.
pub trait Prompt {
    /// Ask a yes/no question. An empty answer selects `default`; invalid
    /// answers re-prompt.
    fn confirm(&mut self, question: &str, default: bool) -> Result<bool>;

    /// Read a line of input; an empty answer selects `default`.
    fn input(&mut self, question: &str, default: &str) -> Result<String>;

    /// Read a secret without echoing it.
    fn password(&mut self, question: &str) -> Result<String>;

    /// Pick one of `items` by index. An empty answer selects `default`;
    /// out-of-range or non-numeric answers re-prompt.
    fn select(&mut self, question: &str, items: &[&str], default: usize) -> Result<usize>;
}

/// Terminal-backed [`Prompt`] reading from stdin.
#[derive(Debug, Default)]
pub struct TermPrompt;

impl TermPrompt {
    fn read_line(&self) -> Result<String> {
        let mut line = String::new();
        io::stdin()
            .read_line(&mut line)
            .context("Failed to read from stdin")?;
        Ok(line.trim().to_string())
    }
}

impl Prompt for TermPrompt {
    fn confirm(&mut self, question: &str, default: bool) -> Result<bool> {
        let suffix = if default { "[Y/n]" } else { "[y/N]" };
        loop {
            print!("{} {}: ", question, suffix);
            io::stdout().flush()?;
            let ans = self.read_line()?.to_lowercase();
            if ans.is_empty() {
                return Ok(default);
            }
            match ans.as_str() {
                "y" | "yes" => return Ok(true),
                "n" | "no" => return Ok(false),
                _ => println!("Please answer 'y' or 'n'."),
            }
        }
    }

    fn input(&mut self, question: &str, default: &str) -> Result<String> {
        if default.is_empty() {
            print!("{}: ", question);
        } else {
            print!("{} [{}]: ", question, default);
        }
        io::stdout().flush()?;
        let ans = self.read_line()?;
        if ans.is_empty() {
            Ok(default.to_string())
        } else {
            Ok(ans)
        }
    }

    fn password(&mut self, question: &str) -> Result<String> {
        rpassword::prompt_password(format!("{}: ", question)).context("Failed to read password")
    }

    fn select(&mut self, question: &str, items: &[&str], default: usize) -> Result<usize> {
        println!("{}:", question);
        for (i, item) in items.iter().enumerate() {
            println!("  [{}] {}", i, item);
        }
        loop {
            print!("Selection [{}]: ", default);
            io::stdout().flush()?;
            let ans = self.read_line()?;
            if ans.is_empty() {
                return Ok(default);
            }
            match ans.parse::<usize>() {
                Ok(n) if n < items.len() => return Ok(n),
                _ => println!("Invalid selection."),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;

    /// A scripted answer consumed by [`ScriptedPrompt`].
    #[derive(Debug, Clone)]
    pub enum Answer {
        Confirm(bool),
        Input(String),
        Password(String),
        Select(usize),
    }

    /// Deterministic [`Prompt`] fed from a fixed answer script. Also records
    /// the questions asked, in order, for assertions.
    #[derive(Debug, Default)]
    pub struct ScriptedPrompt {
        answers: VecDeque<Answer>,
        pub asked: Vec<String>,
    }

    impl ScriptedPrompt {
        pub fn new(answers: impl IntoIterator<Item = Answer>) -> Self {
            Self {
                answers: answers.into_iter().collect(),
                asked: Vec::new(),
            }
        }

        fn next(&mut self, question: &str) -> Answer {
            self.asked.push(question.to_string());
            self.answers
                .pop_front()
                .unwrap_or_else(|| panic!("no scripted answer left for: {question}"))
        }
    }

    impl Prompt for ScriptedPrompt {
        fn confirm(&mut self, question: &str, _default: bool) -> Result<bool> {
            match self.next(question) {
                Answer::Confirm(v) => Ok(v),
                other => panic!("expected Confirm answer for '{question}', got {other:?}"),
            }
        }

        fn input(&mut self, question: &str, default: &str) -> Result<String> {
            match self.next(question) {
                Answer::Input(v) if v.is_empty() => Ok(default.to_string()),
                Answer::Input(v) => Ok(v),
                other => panic!("expected Input answer for '{question}', got {other:?}"),
            }
        }

        fn password(&mut self, question: &str) -> Result<String> {
            match self.next(question) {
                Answer::Password(v) => Ok(v),
                other => panic!("expected Password answer for '{question}', got {other:?}"),
            }
        }

        fn select(&mut self, question: &str, items: &[&str], default: usize) -> Result<usize> {
            match self.next(question) {
                Answer::Select(n) => {
                    assert!(n < items.len(), "scripted selection out of range");
                    Ok(n)
                }
                Answer::Input(v) if v.is_empty() => Ok(default),
                other => panic!("expected Select answer for '{question}', got {other:?}"),
            }
        }
    }
}
