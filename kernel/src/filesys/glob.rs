//! Shell-style wildcard matching.
//!
//! Supports `*`, `?`, bracket classes with ranges and `^`/`!` negation, and
//! `\` escapes. Matching is anchored at both ends and works on bytes.

/// Whether `text` matches `pattern` in full.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let (pat, text) = (pattern.as_bytes(), text.as_bytes());
    let (mut pi, mut ti) = (0, 0);
    // Pattern index after the last `*`, and the text index it is currently absorbing up to.
    let mut star: Option<(usize, usize)> = None;

    while ti < text.len() {
        if pat.get(pi) == Some(&b'*') {
            pi += 1;
            star = Some((pi, ti));
            continue;
        }
        if let Some(len) = match_one(&pat[pi..], text[ti]) {
            pi += len;
            ti += 1;
            continue;
        }
        match star {
            Some((after_star, absorbed)) => {
                pi = after_star;
                ti = absorbed + 1;
                star = Some((after_star, ti));
            }
            None => return false,
        }
    }
    pat[pi..].iter().all(|&b| b == b'*')
}

/// Match one pattern element against `c`, returning the pattern bytes consumed.
fn match_one(pat: &[u8], c: u8) -> Option<usize> {
    match *pat.first()? {
        b'?' => Some(1),
        b'[' => match match_class(&pat[1..], c) {
            Some((matched, len)) => matched.then_some(len + 1),
            // Unterminated class: a literal bracket.
            None => (c == b'[').then_some(1),
        },
        b'\\' if pat.len() > 1 => (pat[1] == c).then_some(2),
        literal => (literal == c).then_some(1),
    }
}

/// Body of a bracket class (after `[`). Returns (matched, bytes up to and including `]`).
fn match_class(body: &[u8], c: u8) -> Option<(bool, usize)> {
    let mut i = 0;
    let negate = matches!(body.first(), Some(b'^' | b'!'));
    if negate {
        i += 1;
    }

    let mut found = false;
    let mut first = true;
    loop {
        let lo = *body.get(i)?;
        if lo == b']' && !first {
            return Some((found != negate, i + 1));
        }
        first = false;
        match (body.get(i + 1), body.get(i + 2)) {
            (Some(b'-'), Some(&hi)) if hi != b']' => {
                let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
                found |= (lo..=hi).contains(&c);
                i += 3;
            }
            _ => {
                found |= lo == c;
                i += 1;
            }
        }
    }
}

/// Whether `s` contains any wildcard metacharacter.
pub fn has_wildcards(s: &str) -> bool {
    s.bytes().any(|b| matches!(b, b'*' | b'?' | b'['))
}
