//! Interactive shell.
//!
//! A line is split into words and the operators `|`, `>`, `>>` and a trailing
//! `&`, then run as a pipeline: each stage's output buffer becomes the next
//! stage's stdin and the last buffer goes to the terminal or the redirect
//! target. Background jobs run as their own task and report to the same
//! terminal.

use alloc::{
    format,
    string::{String, ToString},
    vec::Vec,
};
use core::fmt;
use core::fmt::Write;

use crate::constants::shell::{MAX_ARGS, MAX_PIPELINE, PROMPT_PREFIX};
use crate::devices::console::{self, Terminal};
use crate::errors::KernelError;
use crate::filesys::{
    self,
    glob::has_wildcards,
    glob_match,
    path::{file_name, normalize, parent},
    resolve_path, FsError,
};
use crate::programs::{self, StdOut};
use crate::sched;

/// Commands the shell runs itself because they change its own state.
pub const BUILTINS: &[(&str, &str)] = &[
    ("cd", "change the working directory"),
    ("pwd", "print the working directory"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Pipe,
    Background,
    Redirect { append: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    UnterminatedQuote,
    EmptyStage,
    MissingTarget,
    MisplacedAmpersand,
    TooManyStages,
    TooManyArgs,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::UnterminatedQuote => write!(f, "unterminated quote"),
            ParseError::EmptyStage => write!(f, "empty command in pipeline"),
            ParseError::MissingTarget => write!(f, "redirect without a target"),
            ParseError::MisplacedAmpersand => write!(f, "& must end the line"),
            ParseError::TooManyStages => write!(f, "pipeline too long"),
            ParseError::TooManyArgs => write!(f, "too many arguments"),
        }
    }
}

/// Output redirection, with the target already made absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub path: String,
    pub append: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Job {
    pub stages: Vec<Vec<String>>,
    pub redirect: Option<Redirect>,
    pub background: bool,
}

impl Job {
    pub fn name(&self) -> &str {
        self.stages
            .first()
            .and_then(|argv| argv.first())
            .map_or("job", String::as_str)
    }
}

fn flush_word(tokens: &mut Vec<Token>, word: &mut String, in_word: &mut bool) {
    if *in_word {
        tokens.push(Token::Word(core::mem::take(word)));
        *in_word = false;
    }
}

/// Split a line into words and operators.
///
/// Backslashes are kept together with the character they escape, so the
/// program sees them; that is how `echo -e` gets its escapes.
fn tokenize(line: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' | '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some(q) if q == c => break,
                        Some('\\') if c == '"' => {
                            word.push('\\');
                            if let Some(next) = chars.next() {
                                word.push(next);
                            }
                        }
                        Some(other) => word.push(other),
                        None => return Err(ParseError::UnterminatedQuote),
                    }
                }
            }
            '\\' => {
                in_word = true;
                word.push('\\');
                if let Some(next) = chars.next() {
                    word.push(next);
                }
            }
            '|' | '&' | '>' => {
                flush_word(&mut tokens, &mut word, &mut in_word);
                tokens.push(match c {
                    '|' => Token::Pipe,
                    '&' => Token::Background,
                    _ => Token::Redirect {
                        append: chars.next_if_eq(&'>').is_some(),
                    },
                });
            }
            c if c.is_whitespace() => flush_word(&mut tokens, &mut word, &mut in_word),
            other => {
                in_word = true;
                word.push(other);
            }
        }
    }
    flush_word(&mut tokens, &mut word, &mut in_word);
    Ok(tokens)
}

/// Parse a command line. A blank line is `Ok(None)`.
pub fn parse(line: &str) -> Result<Option<Job>, ParseError> {
    let tokens = tokenize(line)?;
    if tokens.is_empty() {
        return Ok(None);
    }

    let mut job = Job::default();
    let mut stage: Vec<String> = Vec::new();
    let mut tokens = tokens.into_iter().peekable();
    while let Some(token) = tokens.next() {
        match token {
            Token::Word(word) => {
                if stage.len() == MAX_ARGS {
                    return Err(ParseError::TooManyArgs);
                }
                stage.push(word);
            }
            Token::Pipe => {
                // Output can only go one way.
                if stage.is_empty() || job.redirect.is_some() {
                    return Err(ParseError::EmptyStage);
                }
                job.stages.push(core::mem::take(&mut stage));
            }
            Token::Redirect { append } => match tokens.next() {
                Some(Token::Word(target)) if job.redirect.is_none() => {
                    job.redirect = Some(Redirect {
                        path: resolve_path(&target),
                        append,
                    });
                }
                _ => return Err(ParseError::MissingTarget),
            },
            Token::Background => {
                if tokens.peek().is_some() {
                    return Err(ParseError::MisplacedAmpersand);
                }
                job.background = true;
            }
        }
    }
    if stage.is_empty() {
        return Err(ParseError::EmptyStage);
    }
    job.stages.push(stage);
    if job.stages.len() > MAX_PIPELINE {
        return Err(ParseError::TooManyStages);
    }
    Ok(Some(job))
}

fn cd(argv: &[String], out: &mut StdOut) -> Result<(), KernelError> {
    let target = argv.get(1).map_or_else(|| String::from("/"), |arg| resolve_path(arg));
    let pattern = file_name(&target);
    let target = if has_wildcards(pattern) {
        let dir = parent(&target);
        let matches: Vec<String> = filesys::with_ramfs(|fs| fs.entries(dir))?
            .into_iter()
            .filter(|entry| entry.is_dir && glob_match(pattern, &entry.name))
            .map(|entry| normalize(dir, &entry.name))
            .collect();
        match matches.as_slice() {
            [only] => only.clone(),
            _ => return Err(KernelError::NotFound),
        }
    } else {
        target
    };

    if !filesys::stat(&target)?.is_dir {
        return Err(FsError::NotDirectory.into());
    }
    filesys::set_cwd(&target);
    out.write_bytes(b"ok\n");
    Ok(())
}

/// One pipeline stage: a builtin, or whatever the registry has under `argv[0]`.
pub async fn exec_stage(argv: &[String], stdin: &[u8], out: &mut StdOut) -> isize {
    let result = match argv.first().map(String::as_str) {
        Some("cd") => cd(argv, out),
        Some("pwd") => {
            let _ = writeln!(out, "{}", filesys::cwd());
            Ok(())
        }
        _ => return programs::dispatch(argv, stdin, out).await,
    };
    match result {
        Ok(()) => out.len() as isize,
        Err(err) => err.status(),
    }
}

/// Run every stage in order and deliver the last output. Returns the status
/// of the last stage that ran.
///
/// A failing stage stops the pipeline; its output, or `fail` when it wrote
/// nothing, goes to the terminal and never to the redirect target.
pub async fn run_job<T: Terminal + ?Sized>(job: &Job, term: &mut T) -> isize {
    let mut carried: Vec<u8> = Vec::new();
    let mut status = 0;
    for argv in &job.stages {
        let mut out = StdOut::default();
        status = exec_stage(argv, &carried, &mut out).await;
        carried = out.into_bytes();
        if status < 0 || sched::signal_pending() {
            break;
        }
    }

    if status < 0 {
        if carried.is_empty() {
            term.write_bytes(b"fail\n");
        } else {
            term.write_bytes(&carried);
        }
        return status;
    }
    match &job.redirect {
        Some(redirect) => {
            if let Err(err) = filesys::write_file(&redirect.path, &carried, redirect.append) {
                log::debug!("shell: redirect to {} failed: {}", redirect.path, err);
                term.write_bytes(b"fail\n");
                return KernelError::from(err).status();
            }
        }
        None => term.write_bytes(&carried),
    }
    status
}

pub struct Shell<T> {
    term: T,
}

impl<T: Terminal + Clone + 'static> Shell<T> {
    pub fn new(term: T) -> Shell<T> {
        Shell { term }
    }

    pub fn prompt(&mut self) {
        let prompt = format!("{}{}$ ", PROMPT_PREFIX, filesys::cwd());
        self.term.write_str(&prompt);
    }

    /// Parse and run one line. Background jobs return 0 once spawned.
    pub async fn execute(&mut self, line: &str) -> isize {
        let job = match parse(line) {
            Ok(Some(job)) => job,
            Ok(None) => return 0,
            Err(err) => {
                log::debug!("shell: {}: {}", line, err);
                self.term.write_bytes(b"error parsing\n");
                return KernelError::Invalid.status();
            }
        };
        if job.background {
            return self.spawn_background(job);
        }
        run_job(&job, &mut self.term).await
    }

    fn spawn_background(&mut self, job: Job) -> isize {
        let name = job.name().to_string();
        let mut term = self.term.clone();
        let spawned = sched::spawn_isolated(&name, async move {
            let status = run_job(&job, &mut term).await;
            i32::try_from(status).unwrap_or(i32::MIN)
        });
        match spawned {
            Some(pid) => {
                self.term.write_str(&format!("[bg] pid {}\n", pid));
                0
            }
            None => {
                self.term.write_bytes(b"fail\n");
                KernelError::OutOfMemory.status()
            }
        }
    }

    /// Prompt, read, execute, forever. Takes Ctrl-C for itself while idle.
    pub async fn run(mut self) -> i32 {
        if let Some(pid) = sched::current_pid() {
            console::set_foreground(pid);
        }
        loop {
            self.prompt();
            match console::read_line(&mut self.term).await {
                Ok(line) => {
                    self.execute(&line).await;
                    sched::clear_signal();
                }
                Err(err) => log::trace!("shell: line dropped: {}", err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::Pid;
    use crate::test_support::{lock_globals, Capture};
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicIsize, Ordering};
    use std::sync::MutexGuard;

    fn words(list: &[&str]) -> Vec<String> {
        list.iter().map(|w| w.to_string()).collect()
    }

    fn setup() -> (MutexGuard<'static, ()>, Capture) {
        let guard = lock_globals();
        sched::init();
        console::init();
        filesys::init_with_device(None).unwrap();
        (guard, Capture::new())
    }

    /// Execute `line` in a task of its own and collect what it printed.
    fn run_line(term: &Capture, line: &str) -> (isize, String) {
        term.clear();
        let status = Arc::new(AtomicIsize::new(0));
        let (sink, line, shell_term) = (status.clone(), String::from(line), term.clone());
        let pid = sched::spawn("sh", async move {
            let mut shell = Shell::new(shell_term);
            sink.store(shell.execute(&line).await, Ordering::SeqCst);
            0
        })
        .unwrap();
        while sched::exists(pid) {
            sched::dispatch_next();
        }
        (status.load(Ordering::SeqCst), term.text())
    }

    #[test]
    fn test_tokenize_words_and_operators() {
        let tokens = tokenize(r#"echo "a b"|cat>>x &"#).unwrap();
        assert_eq!(
            tokens,
            [
                Token::Word("echo".into()),
                Token::Word("a b".into()),
                Token::Pipe,
                Token::Word("cat".into()),
                Token::Redirect { append: true },
                Token::Word("x".into()),
                Token::Background,
            ]
        );
        assert_eq!(tokenize(r#"'' x"#).unwrap(), [Token::Word("".into()), Token::Word("x".into())]);
        assert_eq!(tokenize(r#""q\"" a\ b"#).unwrap(), [Token::Word(r#"q\""#.into()), Token::Word(r"a\ b".into())]);
        assert_eq!(tokenize("say 'no"), Err(ParseError::UnterminatedQuote));
    }

    #[test]
    fn test_parse_pipeline_and_redirect() {
        let _guard = lock_globals();
        filesys::set_cwd("/tmp");
        let job = parse("cat f | grep x > out").unwrap().unwrap();
        filesys::set_cwd("/");
        assert_eq!(job.stages, [words(&["cat", "f"]), words(&["grep", "x"])]);
        assert_eq!(job.redirect, Some(Redirect { path: "/tmp/out".into(), append: false }));
        assert!(!job.background);

        let job = parse("sleep 2 &").unwrap().unwrap();
        assert!(job.background);
        assert_eq!(job.name(), "sleep");
        assert_eq!(parse("   "), Ok(None));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse("ls |"), Err(ParseError::EmptyStage));
        assert_eq!(parse("| ls"), Err(ParseError::EmptyStage));
        assert_eq!(parse("echo >"), Err(ParseError::MissingTarget));
        assert_eq!(parse("echo > a > b"), Err(ParseError::MissingTarget));
        assert_eq!(parse("echo > a | cat"), Err(ParseError::EmptyStage));
        assert_eq!(parse("sleep 1 & ls"), Err(ParseError::MisplacedAmpersand));
        assert_eq!(parse("a | b | c | d | e"), Err(ParseError::TooManyStages));
        let long = ["x"; MAX_ARGS + 1].join(" ");
        assert_eq!(parse(&long), Err(ParseError::TooManyArgs));
    }

    #[test]
    fn test_write_then_cat_and_ls() {
        let (_guard, term) = setup();
        assert_eq!(run_line(&term, "mkdir /a").1, "ok\n");
        assert_eq!(run_line(&term, "write /a/f hello world").1, "wrote\n");
        assert_eq!(run_line(&term, "cat /a/f").1, "hello world");
        assert_eq!(run_line(&term, "ls /a").1, "f\n");
    }

    #[test]
    fn test_echo_escapes_into_head() {
        let (_guard, term) = setup();
        let (status, text) = run_line(&term, r#"echo -e "one\ntwo\nthree" > /tmp/x"#);
        assert!(status > 0);
        assert_eq!(text, "");
        assert_eq!(run_line(&term, "head -n 2 /tmp/x").1, "one\ntwo\n");
        assert_eq!(run_line(&term, "echo four >> /tmp/x").1, "");
        assert_eq!(run_line(&term, "tail -n 2 /tmp/x").1, "three\nfour\n");
    }

    #[test]
    fn test_tree_shows_nesting() {
        let (_guard, term) = setup();
        run_line(&term, "mkdir /a");
        run_line(&term, "write /a/f hello world");
        let (_, text) = run_line(&term, "tree /");
        assert!(text.starts_with("a/\n  f\n"));
    }

    #[test]
    fn test_kill_background_job() {
        let (_guard, term) = setup();
        let (status, text) = run_line(&term, "sleep 2 &");
        assert_eq!(status, 0);
        let pid: Pid = text.trim().strip_prefix("[bg] pid ").unwrap().parse().unwrap();
        assert!(sched::exists(pid));

        assert!(run_line(&term, &format!("kill {}", pid)).1.contains("killed\n"));
        let before = sched::ticks();
        let (status, _) = run_line(&term, &format!("wait {}", pid));
        assert_eq!(status, 0);
        assert!(sched::ticks() - before < 10);

        let (_, listing) = run_line(&term, "ps");
        let pid = pid.to_string();
        assert!(!listing.lines().skip(1).any(|row| row.split_whitespace().next() == Some(pid.as_str())));
    }

    #[test]
    fn test_cp_leaves_source_alone() {
        let (_guard, term) = setup();
        run_line(&term, "mkdir /a");
        run_line(&term, "write /a/f hello world");
        assert_eq!(run_line(&term, "cp /a/f /b").1, "ok\n");
        assert_eq!(run_line(&term, "cat /b").1, "hello world");
        assert_eq!(run_line(&term, "cat /a/f").1, "hello world");
    }

    #[test]
    fn test_failed_command_prints_fail() {
        let (_guard, term) = setup();
        run_line(&term, "mkdir /a");
        run_line(&term, "write /a/f x");
        assert_eq!(run_line(&term, "rm -r /a").1, "ok\n");
        let (status, text) = run_line(&term, "ls /a");
        assert!(status < 0);
        assert_eq!(text, "fail\n");
    }

    #[test]
    fn test_pipeline_and_messages() {
        let (_guard, term) = setup();
        assert_eq!(run_line(&term, r"echo -e b\na\nb | grep b | head -n 1").1, "b\n");
        assert_eq!(run_line(&term, "frob").1, "unknown command\n");
        assert_eq!(run_line(&term, "echo 'open").1, "error parsing\n");
        assert_eq!(run_line(&term, "").0, 0);

        // A failing stage never reaches the redirect target.
        run_line(&term, "cat /missing > /tmp/out");
        assert_eq!(filesys::stat("/tmp/out"), Err(FsError::NotFound));
        assert_eq!(run_line(&term, "echo x > /nodir/out").1, "fail\n");
    }

    #[test]
    fn test_cd_and_pwd() {
        let (_guard, term) = setup();
        assert_eq!(run_line(&term, "cd /tmp").1, "ok\n");
        assert_eq!(run_line(&term, "pwd").1, "/tmp\n");
        assert_eq!(run_line(&term, "cd ..").1, "ok\n");
        assert_eq!(run_line(&term, "pwd").1, "/\n");
        assert_eq!(run_line(&term, "cd /h*").1, "ok\n");
        assert_eq!(filesys::cwd(), "/home");
        assert_eq!(run_line(&term, "cd").1, "ok\n");
        assert_eq!(filesys::cwd(), "/");
        assert_eq!(run_line(&term, "cd /nowhere").1, "fail\n");
        run_line(&term, "write /tmp/file x");
        assert_eq!(run_line(&term, "cd /tmp/file").1, "fail\n");
        assert_eq!(filesys::cwd(), "/");
    }

    #[test]
    fn test_interactive_loop() {
        let (_guard, term) = setup();
        console::push_bytes(b"cd /tmp\npwd\n");
        sched::spawn("shell", Shell::new(term.clone()).run()).unwrap();
        sched::run_until_idle();
        assert_eq!(
            term.text(),
            "myras::/$ cd /tmp\nok\nmyras::/tmp$ pwd\n/tmp\nmyras::/tmp$ "
        );
        filesys::set_cwd("/");
    }
}
