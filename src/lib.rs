//! Counter-ambiguity analysis for regular expressions with bounded
//! repetition, built on a counting variant of Glushkov's position-automaton
//! construction.
//!
//! A regex engine that implements `{m,n}` with counter registers (rather
//! than by macro-expanding the repetition) can only promise linear-time
//! matching when the counters count *deterministically*: the same input
//! prefix must never reach the same automaton position with two different
//! counter-value histories.  This crate decides that property, called
//! **counter-ambiguity**, for a normalized regex algebra of literals,
//! character classes, concatenation, alternation (`|`), grouping, `*` and
//! bounded counters `{m}` / `{m,n}`.  (See Kong et al., USENIX Security
//! 2022, for why ambiguous counting is a practical DoS vector.)
//!
//! # Architecture
//!
//! The pipeline is strictly forward:
//!
//! ```text
//! normalized regex
//!   --Scanner-->          tokens with position / quantifier ids
//!   --set builder-->      Glushkov sets P, D, F, L + per-token annotations
//!   --Nca::build-->       counter automaton (guarded transitions)
//!   --Nfa::unfold-->      explicit NFA over reachable configurations
//!   --ProductNfa::new-->  self-product, searched for ambiguous pairs
//! ```
//!
//! * The **scanner** tokenizes the normalized string.  Literal and class
//!   tokens receive position ids in scan order (these become automaton
//!   states); `*` and `{m,n}` draw from a second, shared quantifier-id
//!   sequence whose relative order later decides which quantifier was
//!   applied last at a position.
//! * The **set builder** evaluates the token stream with an explicit
//!   operand stack of [`Sets`] and an operator stack of tokens, reducing
//!   with operator precedence (concatenation implicit and binding tighter
//!   than `|`).  Besides the classical P (first positions), D (last
//!   positions), F (follow pairs) and L (nullability) sets, it accumulates
//!   counter bookkeeping per position: which counters are incremented,
//!   initialized or merely associated there, and which stars end there.
//! * The **NCA builder** allocates one state per position plus a start
//!   state, then turns F pairs into transitions: unconditional, forward
//!   (guarded by the source's counters), backward over a counter (the
//!   looping edge of `{m,n}`, increments its governing counter) or backward
//!   over a star (resets inner counters, no increment).
//! * The **unfolder** explores reachable `(state, counter values)`
//!   configurations breadth-first.  Every counter ranges over a bounded
//!   domain, so this terminates, but the state count can be exponential in
//!   the number of independent counters.
//! * The **ambiguity analyzer** builds the self-product of the unfolded
//!   NFA.  A reachable pair of NFA states is ambiguous iff both project to
//!   the same NCA position with different counter values.  The exact
//!   analysis explores the full product; the approximate analysis instead
//!   re-runs the exact analysis on cheaper variants of the regex where all
//!   but one counter occurrence are widened to `*`.
//!
//! The matcher ([`Nfa::try_match`]) is a plain on-the-fly subset
//! simulation used to validate the construction against fullmatch
//! semantics; it is not a competitive regex engine and does not try to be.
//!
//! All iteration that affects output or analysis order is over ordered
//! containers (`BTreeMap`/`BTreeSet`) or insertion-ordered ones
//! (`indexmap`), so construction, diagnostics and witness reporting are
//! deterministic.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::{self, Write as _};
use std::ops::{Index, IndexMut};

use indexmap::{IndexMap, IndexSet};
use regex_syntax::hir::{Class, HirKind};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// An error produced while scanning or analyzing a normalized regex.
///
/// The front end that rewrites human-written syntax (anchors, `+`, `?`,
/// unbounded counters) into the normalized algebra is a separate
/// component; most of these variants signal that its output contract was
/// violated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// A character class `[...` with no closing `]`.
    UnterminatedClass,
    /// A counter `{...` with no closing `}`.
    UnterminatedCounter,
    /// A lone `\` at the end of the pattern.
    DanglingEscape,
    /// A counter body that does not parse as `{m}`, `{m,n}` or `{m,}`.
    InvalidCounter(String),
    /// A class token rejected by `regex-syntax`.
    InvalidClass(String),
    /// Unmatched `(` or `)`.
    UnbalancedGroup,
    /// An operator with too few operands (e.g. a leading `*` or an empty
    /// group).
    MissingOperand,
    /// Approximate ambiguity analysis requires at least one counter
    /// occurrence in the regex.
    MissingCounter,
    /// Unfolding exceeded the caller-supplied state budget.
    StateLimit(usize),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnterminatedClass => write!(f, "unterminated character class"),
            Self::UnterminatedCounter => write!(f, "unterminated counter"),
            Self::DanglingEscape => write!(f, "dangling escape at end of pattern"),
            Self::InvalidCounter(body) => write!(f, "invalid counter `{}`", body),
            Self::InvalidClass(msg) => write!(f, "invalid character class: {}", msg),
            Self::UnbalancedGroup => write!(f, "unbalanced group"),
            Self::MissingOperand => write!(f, "operator is missing an operand"),
            Self::MissingCounter => {
                write!(f, "approximate analysis requires at least one counter")
            }
            Self::StateLimit(limit) => {
                write!(f, "unfolding exceeded the state budget of {}", limit)
            }
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// Ids, counter ranges
// ---------------------------------------------------------------------------

/// Index of an NCA state, equal to the position id of its token.
///
/// Position 0 is the synthetic start state; literal/class tokens are
/// numbered from 1 in scan order.  [`StateIdx::NONE`] marks tokens that are
/// not positions (operators).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateIdx(u32);

impl StateIdx {
    const NONE: Self = Self(u32::MAX);
    const START: Self = Self(0);

    #[inline]
    fn idx(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for StateIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Id of a quantifier (`*` or `{m,n}`), drawn from a single scan-order
/// sequence shared by stars and counters.  The relative order of two
/// quantifier ids tells which quantifier was applied last at a position.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QuantId(u32);

impl fmt::Display for QuantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The `[lower, upper]` bound of one `{m,n}` occurrence.
///
/// `upper` is `None` for the unbounded sentinel `{m,}`.  The front end is
/// required to rewrite unbounded counters before the core sees them; a
/// sentinel range never satisfies any guard, mirroring the contract
/// violation rather than handling it.
///
/// `lower` may be relaxed to 0 during set construction when the guarded
/// subexpression is itself nullable: the empty string can pad for counts
/// below the written lower bound, so the bound is not actually enforced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CounterRange {
    id: QuantId,
    lower: u32,
    upper: Option<u32>,
}

impl CounterRange {
    fn is_out_of_range(&self, count: u32) -> bool {
        count < self.lower || self.upper.map_or(true, |u| count > u)
    }

    fn is_below_upper(&self, count: u32) -> bool {
        self.upper.map_or(false, |u| count < u)
    }
}

impl fmt::Display for CounterRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(c_id={}, range=", self.id)?;
        match self.upper {
            Some(u) if u == self.lower => write!(f, "{{{}}}", self.lower)?,
            Some(u) => write!(f, "{{{}, {}}}", self.lower, u)?,
            None => write!(f, "{{{},}}", self.lower)?,
        }
        write!(f, ")")
    }
}

/// Inclusive character ranges of one class token, resolved by the scanner.
type CharRanges = Vec<(char, char)>;

/// Counter values of a configuration, keyed by quantifier id.  A counter
/// appears only once it has been initialized on some path into its scope.
type CounterValues = BTreeMap<QuantId, u32>;

// ---------------------------------------------------------------------------
// Tokens and scanner
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
enum TokenKind {
    /// A single literal character (possibly written escaped).
    Literal,
    /// `[...]`, `.` or a predefined class; ranges resolved at scan time.
    Class(CharRanges),
    Star(QuantId),
    Counter(CounterRange),
    Bar,
    LParen,
    RParen,
    /// Implicit concatenation operator inserted by the set builder.
    Concat,
    /// The synthetic token of the start state.
    Start,
}

/// One regex primitive: a position (literal/class), a quantifier or an
/// operator.  Frozen after scanning; all mutable bookkeeping lives in
/// side tables keyed by position id.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Token {
    symbol: String,
    /// Position id for literal/class tokens, [`StateIdx::NONE`] otherwise.
    id: StateIdx,
    kind: TokenKind,
}

impl Token {
    fn concat() -> Self {
        Token {
            symbol: String::new(),
            id: StateIdx::NONE,
            kind: TokenKind::Concat,
        }
    }

    fn start() -> Self {
        Token {
            symbol: String::new(),
            id: StateIdx::START,
            kind: TokenKind::Start,
        }
    }

    fn is_position(&self) -> bool {
        matches!(self.kind, TokenKind::Literal | TokenKind::Class(_))
    }
}

/// Vertical whitespace, what `\v` means in the normalized algebra (the
/// front end targets Java-style predefined classes; `regex-syntax` would
/// read `\v` as a vertical-tab literal instead).
const VERTICAL_WS: &str = "[\\n\\x0B\\x0C\\r\\x{85}\\x{2028}\\x{2029}]";
const NOT_VERTICAL_WS: &str = "[^\\n\\x0B\\x0C\\r\\x{85}\\x{2028}\\x{2029}]";

/// Resolve a class token to explicit character ranges via `regex-syntax`.
fn class_ranges(symbol: &str) -> Result<CharRanges, Error> {
    let pattern = match symbol {
        "\\v" => VERTICAL_WS,
        "\\V" => NOT_VERTICAL_WS,
        other => other,
    };
    let hir = regex_syntax::parse(pattern)
        .map_err(|e| Error::InvalidClass(format!("`{}`: {}", symbol, e)))?;
    match hir.kind() {
        HirKind::Class(Class::Unicode(class)) => Ok(class
            .ranges()
            .iter()
            .map(|r| (r.start(), r.end()))
            .collect()),
        HirKind::Class(Class::Bytes(class)) => Ok(class
            .ranges()
            .iter()
            .map(|r| (r.start() as char, r.end() as char))
            .collect()),
        // A one-element class may be simplified to a literal.
        HirKind::Literal(lit) => {
            let text = std::str::from_utf8(&lit.0)
                .map_err(|_| Error::InvalidClass(format!("`{}`: not valid UTF-8", symbol)))?;
            let mut chars = text.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Ok(vec![(c, c)]),
                _ => Err(Error::InvalidClass(format!(
                    "`{}`: expected a single-character class",
                    symbol
                ))),
            }
        }
        _ => Err(Error::InvalidClass(format!(
            "`{}`: not a character class",
            symbol
        ))),
    }
}

/// Tokenizer for the normalized regex algebra.
///
/// All counters (input position, next position id, next quantifier id) are
/// owned by the value, so every analysis starts from a fresh scanner.
struct Scanner {
    chars: Vec<char>,
    pos: usize,
    next_id: u32,
    next_quant: u32,
}

impl Scanner {
    fn new(regex: &str) -> Self {
        Scanner {
            chars: regex.chars().collect(),
            pos: 0,
            next_id: 1,
            next_quant: 1,
        }
    }

    fn next_char(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn next_position_id(&mut self) -> StateIdx {
        let id = StateIdx(self.next_id);
        self.next_id += 1;
        id
    }

    fn next_quant_id(&mut self) -> QuantId {
        let id = QuantId(self.next_quant);
        self.next_quant += 1;
        id
    }

    fn literal(&mut self, c: char) -> Token {
        Token {
            symbol: c.to_string(),
            id: self.next_position_id(),
            kind: TokenKind::Literal,
        }
    }

    fn class(&mut self, symbol: String) -> Result<Token, Error> {
        let ranges = class_ranges(&symbol)?;
        Ok(Token {
            symbol,
            id: self.next_position_id(),
            kind: TokenKind::Class(ranges),
        })
    }

    fn operator(symbol: char, kind: TokenKind) -> Token {
        Token {
            symbol: symbol.to_string(),
            id: StateIdx::NONE,
            kind,
        }
    }

    /// Copy a `[...]` class verbatim, up to the first `]`.
    fn scan_char_class(&mut self) -> Result<Token, Error> {
        let mut symbol = String::from("[");
        loop {
            match self.next_char() {
                None => return Err(Error::UnterminatedClass),
                Some(c) => {
                    symbol.push(c);
                    if c == ']' {
                        break;
                    }
                }
            }
        }
        self.class(symbol)
    }

    fn scan_counter(&mut self) -> Result<Token, Error> {
        let mut symbol = String::from("{");
        loop {
            match self.next_char() {
                None => return Err(Error::UnterminatedCounter),
                Some(c) => {
                    symbol.push(c);
                    if c == '}' {
                        break;
                    }
                }
            }
        }
        let body = &symbol[1..symbol.len() - 1];
        let parse = |s: &str| -> Result<u32, Error> {
            s.parse().map_err(|_| Error::InvalidCounter(symbol.clone()))
        };
        let (lower, upper) = match body.split_once(',') {
            None => {
                let n = parse(body)?;
                (n, Some(n))
            }
            // `{m,}` should have been rewritten by the front end; record
            // the unbounded sentinel instead of guessing a bound.
            Some((lo, "")) => (parse(lo)?, None),
            Some((lo, hi)) => (parse(lo)?, Some(parse(hi)?)),
        };
        let range = CounterRange {
            id: self.next_quant_id(),
            lower,
            upper,
        };
        Ok(Token {
            symbol,
            id: StateIdx::NONE,
            kind: TokenKind::Counter(range),
        })
    }

    fn scan_escape(&mut self) -> Result<Token, Error> {
        const PREDEFINED: [char; 8] = ['d', 'D', 's', 'S', 'v', 'V', 'w', 'W'];
        let c = self.next_char().ok_or(Error::DanglingEscape)?;
        if PREDEFINED.contains(&c) {
            self.class(format!("\\{}", c))
        } else {
            // Any other escape is a literal; the backslash is dropped.
            Ok(self.literal(c))
        }
    }

    /// Produce the next token, or `None` at end of input.
    fn next_token(&mut self) -> Result<Option<Token>, Error> {
        let c = match self.next_char() {
            Some(c) => c,
            None => return Ok(None),
        };
        let token = match c {
            '*' => {
                let id = self.next_quant_id();
                Self::operator('*', TokenKind::Star(id))
            }
            '|' => Self::operator('|', TokenKind::Bar),
            '(' => Self::operator('(', TokenKind::LParen),
            ')' => Self::operator(')', TokenKind::RParen),
            '[' => self.scan_char_class()?,
            '.' => self.class(".".to_string())?,
            '{' => self.scan_counter()?,
            '\\' => self.scan_escape()?,
            c => self.literal(c),
        };
        Ok(Some(token))
    }
}

// ---------------------------------------------------------------------------
// Token strings and Glushkov sets
// ---------------------------------------------------------------------------

/// How a follow pair got into F: by concatenation (a forward edge) or by
/// the looping edge of a star or counter (a backward edge).  Part of
/// [`TokenString`] equality, so the same position pair can occur once per
/// producing operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum TransitionTag {
    Concat,
    Star(QuantId),
    Counter(QuantId),
}

/// An ordered sequence of positions, the element type of the Glushkov
/// sets.  P and D hold singletons, F holds pairs, L holds (at most) the
/// empty string.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct TokenString {
    positions: Vec<StateIdx>,
    tag: Option<TransitionTag>,
}

impl TokenString {
    fn empty() -> Self {
        Self::default()
    }

    fn singleton(id: StateIdx) -> Self {
        TokenString {
            positions: vec![id],
            tag: None,
        }
    }

    fn concatenate(&self, suffix: &TokenString) -> TokenString {
        let mut positions = self.positions.clone();
        positions.extend_from_slice(&suffix.positions);
        TokenString {
            positions,
            tag: None,
        }
    }

    fn concatenate_tagged(&self, suffix: &TokenString, tag: TransitionTag) -> TokenString {
        let mut out = self.concatenate(suffix);
        out.tag = Some(tag);
        out
    }

    fn single(&self) -> StateIdx {
        assert_eq!(self.positions.len(), 1, "expected a singleton token string");
        self.positions[0]
    }

    fn pair(&self) -> (StateIdx, StateIdx) {
        assert_eq!(self.positions.len(), 2, "expected a follow pair");
        (self.positions[0], self.positions[1])
    }
}

/// The four Glushkov sets of one subexpression.
///
/// `p`: positions that can start a match; `d`: positions that can end one;
/// `f`: follow pairs (direct transitions); `l`: contains the empty token
/// string iff the subexpression is nullable.
#[derive(Clone, Debug, Default)]
struct Sets {
    p: BTreeSet<TokenString>,
    d: BTreeSet<TokenString>,
    f: BTreeSet<TokenString>,
    l: BTreeSet<TokenString>,
}

impl Sets {
    fn is_nullable(&self) -> bool {
        !self.l.is_empty()
    }
}

fn cross(prefixes: &BTreeSet<TokenString>, suffixes: &BTreeSet<TokenString>) -> BTreeSet<TokenString> {
    let mut out = BTreeSet::new();
    for p in prefixes {
        for s in suffixes {
            out.insert(p.concatenate(s));
        }
    }
    out
}

fn cross_tagged(
    prefixes: &BTreeSet<TokenString>,
    suffixes: &BTreeSet<TokenString>,
    tag: TransitionTag,
) -> BTreeSet<TokenString> {
    let mut out = BTreeSet::new();
    for p in prefixes {
        for s in suffixes {
            out.insert(p.concatenate_tagged(s, tag));
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Set builder (operator-precedence evaluation)
// ---------------------------------------------------------------------------

/// Counter/star bookkeeping of one position, accumulated while the set
/// builder applies quantifiers.  Kept in a side table keyed by position id
/// instead of mutating tokens in place; every list is ordered by
/// quantifier id because quantifiers are applied in scan order.
#[derive(Clone, Debug, Default)]
struct Annotations {
    /// Counters whose looping edge leaves this position (this position is
    /// in the D set of the counter's subexpression).
    incremented: Vec<QuantId>,
    /// Counters that (re)start counting when this position is entered.
    initialized: Vec<QuantId>,
    /// Counters whose scope merely contains this position.  Diagnostic
    /// only, rendered by the NCA display.
    associated: Vec<QuantId>,
    /// Stars whose looping edge leaves this position.
    stars_ending: Vec<QuantId>,
}

/// Output of the set builder: the whole-regex sets, the position tokens in
/// scan order, their annotations, and the final counter table (with any
/// lower-bound relaxations applied).
struct SetsAndTokens {
    sets: Sets,
    state_tokens: Vec<Token>,
    annotations: Vec<Annotations>,
    counters: BTreeMap<QuantId, CounterRange>,
}

#[derive(Default)]
struct SetBuilder {
    operands: Vec<Sets>,
    ops: Vec<Token>,
    state_tokens: Vec<Token>,
    annotations: Vec<Annotations>,
    counters: BTreeMap<QuantId, CounterRange>,
}

impl SetBuilder {
    fn pop_operand(&mut self) -> Result<Sets, Error> {
        self.operands.pop().ok_or(Error::MissingOperand)
    }

    fn annotation_mut(&mut self, id: StateIdx) -> &mut Annotations {
        // Position ids start at 1; the side tables are in scan order.
        &mut self.annotations[id.idx() - 1]
    }

    /// Literal/class: `P = D = {t}`, F and L empty.
    fn compute_sets_for_char(&mut self, token: &Token) {
        let mut sets = Sets::default();
        let letter = TokenString::singleton(token.id);
        sets.p.insert(letter.clone());
        sets.d.insert(letter);
        self.operands.push(sets);
    }

    /// Star: nullable, loop edges D x P tagged with the star, and every
    /// position in D records that this star ends there.
    fn compute_sets_for_star(&mut self, star: QuantId) -> Result<(), Error> {
        let old = self.pop_operand()?;
        for ts in &old.d {
            self.annotation_mut(ts.single()).stars_ending.push(star);
        }
        let mut sets = Sets::default();
        sets.l.insert(TokenString::empty());
        sets.p = old.p.clone();
        sets.d = old.d.clone();
        sets.f = old.f.clone();
        sets.f
            .extend(cross_tagged(&old.d, &old.p, TransitionTag::Star(star)));
        self.operands.push(sets);
        Ok(())
    }

    /// Counter: like star for P and D; the loop edge exists only when the
    /// upper bound admits a second iteration; nullability follows the
    /// lower bound, with the documented lower-bound relaxation when the
    /// operand is itself nullable.
    fn compute_sets_for_counter(&mut self, mut range: CounterRange) -> Result<(), Error> {
        let old = self.pop_operand()?;
        let mut max_id = None;
        for ts in &old.d {
            let id = ts.single();
            self.annotation_mut(id).incremented.push(range.id);
            max_id = Some(max_id.map_or(id, |m: StateIdx| m.max(id)));
        }
        let mut sets = Sets::default();
        if range.lower == 0 {
            sets.l.insert(TokenString::empty());
        } else {
            sets.l = old.l.clone();
            if sets.is_nullable() {
                // The empty string can pad for counts below the written
                // lower bound, so the bound is not actually enforced.
                range.lower = 0;
            }
        }
        self.counters.insert(range.id, range);
        sets.p = old.p.clone();
        sets.d = old.d.clone();
        sets.f = old.f.clone();
        if range.upper.map_or(false, |u| u >= 2) {
            sets.f
                .extend(cross_tagged(&old.d, &old.p, TransitionTag::Counter(range.id)));
        }
        let mut min_id = None;
        for ts in &sets.p {
            let id = ts.single();
            self.annotation_mut(id).initialized.push(range.id);
            min_id = Some(min_id.map_or(id, |m: StateIdx| m.min(id)));
        }
        // Every already-scanned position between the first initializer and
        // the last incrementer lies in the counter's scope.
        if let (Some(min_id), Some(max_id)) = (min_id, max_id) {
            for i in min_id.idx() - 1..max_id.idx() {
                self.annotations[i].associated.push(range.id);
            }
        }
        self.operands.push(sets);
        Ok(())
    }

    /// Reduce the topmost stacked operator (`|` or implicit concat).
    fn apply_operation(&mut self) -> Result<(), Error> {
        let op = self.ops.pop().expect("operator stack underflow");
        let f = self.pop_operand()?;
        let e = self.pop_operand()?;
        let mut sets = Sets::default();
        match op.kind {
            TokenKind::Bar => {
                sets.l.extend(e.l.iter().cloned().chain(f.l.iter().cloned()));
                sets.p.extend(e.p.iter().cloned().chain(f.p.iter().cloned()));
                sets.d.extend(e.d.iter().cloned().chain(f.d.iter().cloned()));
                sets.f.extend(e.f.iter().cloned().chain(f.f.iter().cloned()));
            }
            TokenKind::Concat => {
                sets.l = cross(&e.l, &f.l);
                sets.p = e.p.clone();
                sets.p.extend(cross(&e.l, &f.p));
                sets.d = f.d.clone();
                sets.d.extend(cross(&e.d, &f.l));
                sets.f = e.f.clone();
                sets.f.extend(f.f.iter().cloned());
                sets.f
                    .extend(cross_tagged(&e.d, &f.p, TransitionTag::Concat));
            }
            _ => unreachable!("only `|` and concat are stacked operators"),
        }
        self.operands.push(sets);
        Ok(())
    }

    fn top_is(&self, pred: impl Fn(&TokenKind) -> bool) -> bool {
        self.ops.last().map_or(false, |t| pred(&t.kind))
    }
}

/// A quantifier continues the current operand, anything else ends it.
fn is_last_in_group(next: Option<&Token>) -> bool {
    !matches!(
        next.map(|t| &t.kind),
        Some(TokenKind::Counter(_)) | Some(TokenKind::Star(_))
    )
}

/// Does an implicit concatenation operator go between the finished operand
/// and the next token?
fn can_concat_with(next: Option<&Token>) -> bool {
    matches!(
        next.map(|t| &t.kind),
        Some(TokenKind::Literal) | Some(TokenKind::Class(_)) | Some(TokenKind::LParen)
    )
}

/// Run the operator-precedence evaluation over the token stream and return
/// the whole-regex sets plus the position bookkeeping.
fn compute_sets(regex: &str) -> Result<SetsAndTokens, Error> {
    let mut scanner = Scanner::new(regex);
    let mut builder = SetBuilder::default();
    let mut current = scanner.next_token()?;
    while let Some(token) = current {
        let next = scanner.next_token()?;
        match &token.kind {
            TokenKind::LParen => builder.ops.push(token.clone()),
            TokenKind::RParen => loop {
                match builder.ops.last() {
                    None => return Err(Error::UnbalancedGroup),
                    Some(op) if matches!(op.kind, TokenKind::LParen) => {
                        builder.ops.pop();
                        break;
                    }
                    Some(_) => builder.apply_operation()?,
                }
            },
            TokenKind::Counter(range) => builder.compute_sets_for_counter(*range)?,
            TokenKind::Star(id) => builder.compute_sets_for_star(*id)?,
            TokenKind::Literal | TokenKind::Class(_) => builder.compute_sets_for_char(&token),
            TokenKind::Bar => {
                while builder.top_is(|k| !matches!(k, TokenKind::LParen)) {
                    builder.apply_operation()?;
                }
                builder.ops.push(token.clone());
            }
            TokenKind::Concat | TokenKind::Start => {
                unreachable!("scanner never produces concat or start tokens")
            }
        }
        // Implicit concatenation and end-of-group reduction.  After any
        // operand-producing token that is not immediately quantified,
        // reduce pending concats; then either stack a concat operator for
        // the next operand or, at a group/alternative boundary, reduce
        // pending bars.
        match token.kind {
            TokenKind::Bar | TokenKind::LParen => {}
            _ => {
                if is_last_in_group(next.as_ref()) {
                    while builder.top_is(|k| matches!(k, TokenKind::Concat)) {
                        builder.apply_operation()?;
                    }
                    if can_concat_with(next.as_ref()) {
                        builder.ops.push(Token::concat());
                    } else {
                        while builder.top_is(|k| matches!(k, TokenKind::Bar)) {
                            builder.apply_operation()?;
                        }
                    }
                }
            }
        }
        if token.is_position() {
            builder.state_tokens.push(token);
            builder.annotations.push(Annotations::default());
        }
        current = next;
    }
    if !builder.ops.is_empty() {
        return Err(Error::UnbalancedGroup);
    }
    let sets = builder.pop_operand()?;
    if !builder.operands.is_empty() {
        return Err(Error::MissingOperand);
    }
    Ok(SetsAndTokens {
        sets,
        state_tokens: builder.state_tokens,
        annotations: builder.annotations,
        counters: builder.counters,
    })
}

// ---------------------------------------------------------------------------
// Counter automaton (NCA)
// ---------------------------------------------------------------------------

/// How a transition is guarded and how it updates counters when taken.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TransitionKind {
    /// Always allowed; initializes the destination's counters.
    Unconditional,
    /// A concatenation edge leaving a quantified position: every
    /// dependency must be in range and the last one strictly below its
    /// upper bound.
    ConditionalForward,
    /// The looping edge of a counter.  The governing counter is the last
    /// dependency; it only needs headroom below its upper bound (its lower
    /// bound is irrelevant mid-loop), while the inner dependencies must be
    /// in range.  Taking the edge increments the governing counter and
    /// restarts the destination's inner counters.
    ConditionalBackwardCounter,
    /// The looping edge of a star: every dependency in range, no ceiling
    /// and no increment, inner counters restart.
    ConditionalBackwardStar { star: QuantId },
}

#[derive(Clone, Debug)]
struct NcaTransition {
    dest: StateIdx,
    kind: TransitionKind,
    /// Counters incremented at the source, ordered by quantifier id; for
    /// backward counter edges, truncated at the governing counter.
    dependencies: Vec<CounterRange>,
}

impl NcaTransition {
    fn is_allowed(&self, values: &CounterValues) -> bool {
        let value = |range: &CounterRange| -> u32 {
            *values
                .get(&range.id)
                .expect("dependency counter has no value in this configuration")
        };
        match self.kind {
            TransitionKind::Unconditional => true,
            TransitionKind::ConditionalForward => {
                self.dependencies
                    .iter()
                    .all(|r| !r.is_out_of_range(value(r)))
                    && self
                        .dependencies
                        .last()
                        .map_or(true, |r| r.is_below_upper(value(r)))
            }
            TransitionKind::ConditionalBackwardCounter => {
                match self.dependencies.split_last() {
                    None => true,
                    Some((governing, inner)) => {
                        inner.iter().all(|r| !r.is_out_of_range(value(r)))
                            && governing.is_below_upper(value(governing))
                    }
                }
            }
            TransitionKind::ConditionalBackwardStar { .. } => self
                .dependencies
                .iter()
                .all(|r| !r.is_out_of_range(value(r))),
        }
    }

    /// Counter values after taking this transition into a state that
    /// initializes `dest_initialized` (ordered by quantifier id).
    fn updated_values(
        &self,
        values: &CounterValues,
        dest_initialized: &[CounterRange],
    ) -> CounterValues {
        let mut updated = values.clone();
        match self.kind {
            TransitionKind::ConditionalBackwardCounter => {
                let governing = self
                    .dependencies
                    .last()
                    .expect("backward counter edge without a governing counter");
                for range in dest_initialized {
                    if range.id < governing.id {
                        updated.insert(range.id, 1);
                    } else {
                        break;
                    }
                }
                let current = *values
                    .get(&governing.id)
                    .expect("governing counter has no value in this configuration");
                updated.insert(governing.id, current + 1);
            }
            TransitionKind::ConditionalBackwardStar { star } => {
                for range in dest_initialized {
                    if range.id < star {
                        updated.insert(range.id, 1);
                    } else {
                        break;
                    }
                }
            }
            TransitionKind::Unconditional | TransitionKind::ConditionalForward => {
                for range in dest_initialized {
                    updated.insert(range.id, 1);
                }
            }
        }
        updated
    }
}

impl fmt::Display for NcaTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn ranges(list: &[CounterRange]) -> String {
            let mut out = String::from("[");
            for (i, r) in list.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                let _ = write!(out, "{}", r);
            }
            out.push(']');
            out
        }
        match self.kind {
            TransitionKind::Unconditional => write!(f, "{}", self.dest),
            TransitionKind::ConditionalForward => write!(
                f,
                "{}, when counters {} are within their ranges.",
                self.dest,
                ranges(&self.dependencies)
            ),
            TransitionKind::ConditionalBackwardCounter => {
                let (governing, inner) = self
                    .dependencies
                    .split_last()
                    .expect("backward counter edge without a governing counter");
                write!(
                    f,
                    "{}, when counters {} are within their ranges and counter {} is less than its upper bound.",
                    self.dest,
                    ranges(inner),
                    governing
                )
            }
            TransitionKind::ConditionalBackwardStar { .. } => write!(
                f,
                "{}, when counters {} are within their ranges. (backward * transition)",
                self.dest,
                ranges(&self.dependencies)
            ),
        }
    }
}

/// One state of the counter automaton: a position token plus its resolved
/// annotations and outgoing transitions keyed by the destination symbol.
#[derive(Clone, Debug)]
struct NcaState {
    token: Token,
    id: StateIdx,
    is_start: bool,
    is_final: bool,
    incremented: Vec<CounterRange>,
    initialized: Vec<CounterRange>,
    associated: Vec<CounterRange>,
    stars_ending: Vec<QuantId>,
    transitions: BTreeMap<String, Vec<NcaTransition>>,
}

impl NcaState {
    fn last_quantifier_is_counter(&self) -> bool {
        match (self.incremented.last(), self.stars_ending.last()) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(counter), Some(&star)) => counter.id > star,
        }
    }

    fn last_quantifier_is_star(&self) -> bool {
        match (self.stars_ending.last(), self.incremented.last()) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(&star), Some(counter)) => star > counter.id,
        }
    }
}

impl fmt::Display for NcaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(id={}, symbol={})", self.id, self.token.symbol)
    }
}

impl Index<StateIdx> for [NcaState] {
    type Output = NcaState;

    #[inline]
    fn index(&self, idx: StateIdx) -> &NcaState {
        &self[idx.idx()]
    }
}

impl IndexMut<StateIdx> for [NcaState] {
    #[inline]
    fn index_mut(&mut self, idx: StateIdx) -> &mut NcaState {
        &mut self[idx.idx()]
    }
}

/// A configuration of the counter automaton: a state together with a full
/// assignment of counter values.  Structural equality over both fields is
/// the deduplication key for NFA-state identity.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Configuration {
    state: StateIdx,
    counters: CounterValues,
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{s_id={}, c_vals=[", self.state)?;
        for (i, (id, value)) in self.counters.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "c{}={}", id, value)?;
        }
        write!(f, "]}}")
    }
}

/// A nondeterministic counter automaton built by the Glushkov-style
/// construction: one state per position plus a start state, with guarded
/// transitions over the counter ranges collected during set building.
#[derive(Debug)]
pub struct Nca {
    regex: String,
    /// Frozen after construction; indexing by [`StateIdx`] goes through
    /// the slice impls, which `Vec`'s own `Index` impl would shadow.
    states: Box<[NcaState]>,
}

impl Nca {
    /// Build the counter automaton for a normalized regex.
    pub fn build(regex: &str) -> Result<Self, Error> {
        let sets_and_tokens = compute_sets(regex)?;
        Ok(Self::from_sets(sets_and_tokens, regex.to_owned()))
    }

    fn from_sets(sets_and_tokens: SetsAndTokens, regex: String) -> Self {
        let SetsAndTokens {
            sets,
            state_tokens,
            annotations,
            counters,
        } = sets_and_tokens;

        let finals: BTreeSet<StateIdx> = sets.d.iter().map(|ts| ts.single()).collect();
        let resolve = |ids: &[QuantId]| -> Vec<CounterRange> {
            ids.iter()
                .map(|id| counters[id])
                .collect()
        };

        let mut states = Vec::with_capacity(state_tokens.len() + 1);
        states.push(NcaState {
            token: Token::start(),
            id: StateIdx::START,
            is_start: true,
            // The start state is final iff the whole regex is nullable.
            is_final: sets.is_nullable(),
            incremented: Vec::new(),
            initialized: Vec::new(),
            associated: Vec::new(),
            stars_ending: Vec::new(),
            transitions: BTreeMap::new(),
        });
        for (i, token) in state_tokens.into_iter().enumerate() {
            let id = StateIdx(i as u32 + 1);
            debug_assert_eq!(token.id, id, "position ids must be dense and in scan order");
            let annotation = &annotations[i];
            states.push(NcaState {
                id,
                is_start: false,
                is_final: finals.contains(&id),
                incremented: resolve(&annotation.incremented),
                initialized: resolve(&annotation.initialized),
                associated: resolve(&annotation.associated),
                stars_ending: annotation.stars_ending.clone(),
                transitions: BTreeMap::new(),
                token,
            });
        }

        let mut nca = Nca {
            regex,
            states: states.into_boxed_slice(),
        };
        for ts in &sets.p {
            nca.add_start_transition(ts.single());
        }
        for ts in &sets.f {
            let (src, dest) = ts.pair();
            match ts.tag {
                Some(TransitionTag::Concat) => nca.add_forward_transition(src, dest),
                Some(TransitionTag::Star(star)) => nca.add_backward_star(src, dest, star),
                Some(TransitionTag::Counter(counter)) => {
                    nca.add_backward_counter(src, dest, counter)
                }
                None => unreachable!("follow pair without a transition tag"),
            }
        }
        nca
    }

    fn add_transition(&mut self, src: StateIdx, transition: NcaTransition) {
        let symbol = self.states[transition.dest].token.symbol.clone();
        self.states[src]
            .transitions
            .entry(symbol)
            .or_default()
            .push(transition);
    }

    fn add_start_transition(&mut self, dest: StateIdx) {
        self.add_transition(
            StateIdx::START,
            NcaTransition {
                dest,
                kind: TransitionKind::Unconditional,
                dependencies: Vec::new(),
            },
        );
    }

    fn add_forward_transition(&mut self, src: StateIdx, dest: StateIdx) {
        let state = &self.states[src];
        let transition = if state.last_quantifier_is_counter() || state.last_quantifier_is_star() {
            NcaTransition {
                dest,
                kind: TransitionKind::ConditionalForward,
                dependencies: state.incremented.clone(),
            }
        } else {
            debug_assert!(state.incremented.is_empty() && state.stars_ending.is_empty());
            NcaTransition {
                dest,
                kind: TransitionKind::Unconditional,
                dependencies: Vec::new(),
            }
        };
        self.add_transition(src, transition);
    }

    fn add_backward_counter(&mut self, src: StateIdx, dest: StateIdx, counter: QuantId) {
        let incremented = &self.states[src].incremented;
        let end = incremented
            .iter()
            .position(|r| r.id == counter)
            .expect("backward counter edge from a position that does not increment it");
        let dependencies = incremented[..=end].to_vec();
        debug_assert!(
            self.states[dest].initialized.iter().any(|r| r.id == counter),
            "backward counter edge into a position that does not initialize it"
        );
        self.add_transition(
            src,
            NcaTransition {
                dest,
                kind: TransitionKind::ConditionalBackwardCounter,
                dependencies,
            },
        );
    }

    fn add_backward_star(&mut self, src: StateIdx, dest: StateIdx, star: QuantId) {
        // Quantifier ids are totally ordered and never collide, so the
        // dependencies are exactly the counters inside the star's scope.
        let dependencies: Vec<CounterRange> = self.states[src]
            .incremented
            .iter()
            .take_while(|r| r.id < star)
            .copied()
            .collect();
        self.add_transition(
            src,
            NcaTransition {
                dest,
                kind: TransitionKind::ConditionalBackwardStar { star },
                dependencies,
            },
        );
    }

    /// Number of states (positions plus the start state).
    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    /// The regex this automaton was built from.
    pub fn regex(&self) -> &str {
        &self.regex
    }

    fn root_config(&self) -> Configuration {
        Configuration {
            state: StateIdx::START,
            counters: CounterValues::new(),
        }
    }

    /// A configuration accepts iff its state is final and every counter
    /// incremented at that state is within its range.
    fn is_final_config(&self, config: &Configuration) -> bool {
        let state = &self.states[config.state];
        state.is_final
            && state.incremented.iter().all(|r| {
                let value = *config
                    .counters
                    .get(&r.id)
                    .expect("finalization counter has no value in this configuration");
                !r.is_out_of_range(value)
            })
    }

    /// All configurations reachable from `config` by consuming `symbol`.
    fn successors(&self, config: &Configuration, symbol: &str) -> Vec<Configuration> {
        let state = &self.states[config.state];
        let Some(transitions) = state.transitions.get(symbol) else {
            return Vec::new();
        };
        transitions
            .iter()
            .filter(|t| t.is_allowed(&config.counters))
            .map(|t| Configuration {
                state: t.dest,
                counters: t.updated_values(&config.counters, &self.states[t.dest].initialized),
            })
            .collect()
    }
}

impl fmt::Display for Nca {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "States:\n---")?;
        write!(f, "[")?;
        for (i, state) in self.states.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", state)?;
        }
        writeln!(f, "]\n---")?;
        writeln!(f, "Start States:\n---")?;
        for state in self.states.iter().filter(|s| s.is_start) {
            writeln!(f, "{}", state)?;
        }
        writeln!(f, "---\nFinal configurations:\n---")?;
        for state in self.states.iter().filter(|s| s.is_final) {
            if state.incremented.is_empty() {
                writeln!(f, "{}", state)?;
            } else {
                write!(f, "{} when counters [", state)?;
                for (i, r) in state.incremented.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", r)?;
                }
                writeln!(f, "] are within their ranges.")?;
            }
        }
        writeln!(f, "---\nState counter ranges:\n---")?;
        for state in self.states.iter() {
            writeln!(f, "{}:", state.id)?;
            if !state.associated.is_empty() {
                for (i, r) in state.associated.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", r)?;
                }
                writeln!(f)?;
            }
        }
        writeln!(f, "---\nTransitions:\n---")?;
        for state in self.states.iter() {
            writeln!(f, "Source = {}:", state)?;
            for (symbol, transitions) in &state.transitions {
                for transition in transitions {
                    writeln!(f, "{} -> {}", symbol, transition)?;
                }
            }
        }
        write!(f, "---")
    }
}

// ---------------------------------------------------------------------------
// Unfolded NFA
// ---------------------------------------------------------------------------

/// Index into the NFA state arena.  For diagnostics, states are rendered
/// with ids offset by the NCA state count so the two id spaces never
/// collide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct NfaIdx(u32);

impl NfaIdx {
    #[inline]
    fn idx(self) -> usize {
        self.0 as usize
    }
}

impl Index<NfaIdx> for [NfaState] {
    type Output = NfaState;

    #[inline]
    fn index(&self, idx: NfaIdx) -> &NfaState {
        &self[idx.idx()]
    }
}

#[derive(Clone, Debug)]
struct NfaState {
    config: Configuration,
    transitions: BTreeMap<String, Vec<NfaIdx>>,
}

/// How a transition symbol is tested against one input character.
#[derive(Clone, Debug)]
enum SymbolTest {
    Literal(char),
    Class(CharRanges),
}

/// The explicit finite automaton over reachable configurations of an
/// [`Nca`].
#[derive(Debug)]
pub struct Nfa {
    regex: String,
    /// Frozen after unfolding, like the NCA arena.
    states: Box<[NfaState]>,
    start: NfaIdx,
    finals: BTreeSet<NfaIdx>,
    /// Per transition symbol, how to match it against input characters.
    symbols: BTreeMap<String, SymbolTest>,
    /// Symbol text of each NCA state, for diagnostics.
    nca_symbols: Vec<String>,
    /// NFA ids start here (== NCA state count).
    id_base: usize,
}

impl Nfa {
    /// Unfold the counter automaton into an explicit NFA by breadth-first
    /// exploration of reachable configurations.
    pub fn unfold(nca: &Nca) -> Self {
        match Self::unfold_bounded(nca, usize::MAX) {
            Ok(nfa) => nfa,
            Err(_) => unreachable!("unbounded unfolding cannot exceed a state budget"),
        }
    }

    /// Like [`unfold`](Self::unfold), but gives up with
    /// [`Error::StateLimit`] once more than `max_states` configurations
    /// have been discovered.  The reachable configuration count can be
    /// exponential in the number of independent counters, so batch
    /// harnesses should prefer this entry point.
    pub fn unfold_bounded(nca: &Nca, max_states: usize) -> Result<Self, Error> {
        let mut index: IndexMap<Configuration, NfaIdx> = IndexMap::new();
        let mut states: Vec<NfaState> = Vec::new();
        let mut finals = BTreeSet::new();

        let root = nca.root_config();
        index.insert(root.clone(), NfaIdx(0));
        states.push(NfaState {
            config: root,
            transitions: BTreeMap::new(),
        });
        let mut queue: VecDeque<NfaIdx> = VecDeque::new();
        queue.push_back(NfaIdx(0));

        while let Some(current) = queue.pop_front() {
            // The arena is still growing here, so index the Vec directly.
            let config = states[current.idx()].config.clone();
            if nca.is_final_config(&config) {
                finals.insert(current);
            }
            let mut transitions = BTreeMap::new();
            for symbol in nca.states[config.state].transitions.keys() {
                let mut dests = Vec::new();
                for next in nca.successors(&config, symbol) {
                    let dest = match index.get(&next) {
                        Some(&existing) => existing,
                        None => {
                            if states.len() >= max_states {
                                return Err(Error::StateLimit(max_states));
                            }
                            let fresh = NfaIdx(states.len() as u32);
                            index.insert(next.clone(), fresh);
                            states.push(NfaState {
                                config: next,
                                transitions: BTreeMap::new(),
                            });
                            queue.push_back(fresh);
                            fresh
                        }
                    };
                    dests.push(dest);
                }
                transitions.insert(symbol.clone(), dests);
            }
            states[current.idx()].transitions = transitions;
        }

        let mut symbols: BTreeMap<String, SymbolTest> = BTreeMap::new();
        for state in nca.states.iter() {
            match &state.token.kind {
                TokenKind::Literal => {
                    let mut chars = state.token.symbol.chars();
                    let c = chars
                        .next()
                        .expect("literal token with an empty symbol");
                    assert!(chars.next().is_none(), "literal token with a multi-character symbol");
                    // A class under the same symbol text keeps precedence.
                    symbols
                        .entry(state.token.symbol.clone())
                        .or_insert(SymbolTest::Literal(c));
                }
                TokenKind::Class(ranges) => {
                    symbols.insert(state.token.symbol.clone(), SymbolTest::Class(ranges.clone()));
                }
                TokenKind::Start => {}
                _ => unreachable!("non-position token in the state arena"),
            }
        }

        Ok(Nfa {
            regex: nca.regex.clone(),
            states: states.into_boxed_slice(),
            start: NfaIdx(0),
            finals,
            symbols,
            nca_symbols: nca.states.iter().map(|s| s.token.symbol.clone()).collect(),
            id_base: nca.state_count(),
        })
    }

    /// Number of NFA states (reachable configurations).
    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    /// The regex this automaton was unfolded from.
    pub fn regex(&self) -> &str {
        &self.regex
    }

    fn symbol_matches(&self, symbol: &str, c: char) -> bool {
        match self.symbols.get(symbol) {
            Some(SymbolTest::Literal(l)) => *l == c,
            Some(SymbolTest::Class(ranges)) => {
                ranges.iter().any(|&(lo, hi)| lo <= c && c <= hi)
            }
            None => false,
        }
    }

    fn display_state(&self, idx: NfaIdx) -> String {
        let config = &self.states[idx].config;
        let mut vals = String::from("[");
        for (i, (id, value)) in config.counters.iter().enumerate() {
            if i > 0 {
                vals.push_str(", ");
            }
            let _ = write!(vals, "c{}={}", id, value);
        }
        vals.push(']');
        format!(
            "(id={}, config={{s_id={}, s_sym={}, c_vals={}}})",
            self.id_base + idx.idx(),
            config.state,
            self.nca_symbols[config.state.idx()],
            vals
        )
    }

    // -----------------------------------------------------------------------
    // Matcher (on-the-fly subset simulation)
    // -----------------------------------------------------------------------

    /// Fullmatch `input` against the automaton: maintain the set of active
    /// states, advance it by each input character, and accept iff the
    /// final active set intersects the final states.
    ///
    /// This is a validation tool for the construction, not a regex engine.
    pub fn try_match(&self, input: &str) -> bool {
        let mut active: BTreeSet<NfaIdx> = BTreeSet::new();
        active.insert(self.start);
        for c in input.chars() {
            let mut next = BTreeSet::new();
            for &state in &active {
                for (symbol, dests) in &self.states[state].transitions {
                    if self.symbol_matches(symbol, c) {
                        next.extend(dests.iter().copied());
                    }
                }
            }
            active = next;
            if active.is_empty() {
                break;
            }
        }
        active.iter().any(|s| self.finals.contains(s))
    }

    /// Emit a Graphviz DOT rendering of the unfolded automaton.
    pub fn to_dot(&self) -> String {
        fn escape(symbol: &str) -> String {
            symbol.replace('\\', "\\\\").replace('"', "\\\"")
        }
        let mut out = String::new();
        let _ = writeln!(out, "digraph nfa {{");
        let _ = writeln!(out, "\trankdir=LR;");
        let _ = writeln!(out, "\t{} [shape=box];", self.id_base + self.start.idx());
        for &idx in &self.finals {
            let _ = writeln!(out, "\t{} [peripheries=2];", self.id_base + idx.idx());
        }
        for (i, state) in self.states.iter().enumerate() {
            for (symbol, dests) in &state.transitions {
                for dest in dests {
                    let _ = writeln!(
                        out,
                        "\t{} -> {} [label=\"{}\"];",
                        self.id_base + i,
                        self.id_base + dest.idx(),
                        escape(symbol)
                    );
                }
            }
        }
        let _ = writeln!(out, "}}");
        out
    }
}

impl fmt::Display for Nfa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "States:\n---")?;
        for i in 0..self.states.len() {
            writeln!(f, "{}", self.display_state(NfaIdx(i as u32)))?;
        }
        writeln!(f, "---\nStart States:\n---")?;
        writeln!(f, "{}", self.display_state(self.start))?;
        writeln!(f, "---\nFinal states:\n---")?;
        for &idx in &self.finals {
            writeln!(f, "{}", self.display_state(idx))?;
        }
        writeln!(f, "---\nTransitions:\n---")?;
        for (i, state) in self.states.iter().enumerate() {
            writeln!(f, "{}:", self.id_base + i)?;
            for (symbol, dests) in &state.transitions {
                for &dest in dests {
                    writeln!(f, "{} -> {}", symbol, self.display_state(dest))?;
                }
            }
        }
        write!(f, "---")
    }
}

// ---------------------------------------------------------------------------
// Product automaton and ambiguity analysis
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
struct ProductState {
    a: NfaIdx,
    b: NfaIdx,
    transitions: BTreeMap<String, Vec<usize>>,
}

/// The self-product of an [`Nfa`]: states are ordered pairs of NFA states,
/// transitions are synchronized on a shared symbol.  A reachable pair
/// whose components sit on the same NCA position with different counter
/// values witnesses counter-ambiguity.
pub struct ProductNfa<'a> {
    nfa: &'a Nfa,
    /// Arena of reachable pairs; index 0 is the root `(start, start)`.
    states: Vec<ProductState>,
}

impl<'a> ProductNfa<'a> {
    /// Explore the full reachable product space breadth-first.
    ///
    /// Worst case this is quadratic in the NFA state count, which is
    /// itself worst-case exponential in the number of counters; the
    /// approximate analysis exists for exactly that reason.
    pub fn new(nfa: &'a Nfa) -> Self {
        let mut index: IndexMap<(NfaIdx, NfaIdx), usize> = IndexMap::new();
        let mut states = vec![ProductState {
            a: nfa.start,
            b: nfa.start,
            transitions: BTreeMap::new(),
        }];
        index.insert((nfa.start, nfa.start), 0);
        let mut queue: VecDeque<usize> = VecDeque::new();
        queue.push_back(0);

        while let Some(current) = queue.pop_front() {
            let (a, b) = (states[current].a, states[current].b);
            let mut transitions: BTreeMap<String, Vec<usize>> = BTreeMap::new();
            for (symbol, dests_a) in &nfa.states[a].transitions {
                let Some(dests_b) = nfa.states[b].transitions.get(symbol) else {
                    continue;
                };
                let mut pairs = Vec::new();
                for &dest_a in dests_a {
                    for &dest_b in dests_b {
                        let key = (dest_a, dest_b);
                        let dest = match index.get(&key) {
                            Some(&existing) => existing,
                            None => {
                                let fresh = states.len();
                                index.insert(key, fresh);
                                states.push(ProductState {
                                    a: dest_a,
                                    b: dest_b,
                                    transitions: BTreeMap::new(),
                                });
                                queue.push_back(fresh);
                                fresh
                            }
                        };
                        pairs.push(dest);
                    }
                }
                transitions.insert(symbol.clone(), pairs);
            }
            states[current].transitions = transitions;
        }

        ProductNfa { nfa, states }
    }

    fn pair_is_ambiguous(&self, idx: usize) -> bool {
        let pair = &self.states[idx];
        let config_a = &self.nfa.states[pair.a].config;
        let config_b = &self.nfa.states[pair.b].config;
        config_a.state == config_b.state && config_a.counters != config_b.counters
    }

    /// Exact analysis: is some ambiguous pair reachable?
    pub fn is_ambiguous(&self) -> bool {
        !self.find_ambiguities().is_empty()
    }

    /// Exact analysis with witnesses: every reachable ambiguous pair, as
    /// the two configurations that disagree, in BFS discovery order.
    pub fn find_ambiguities(&self) -> Vec<(Configuration, Configuration)> {
        let mut witnesses = Vec::new();
        let mut seen: IndexSet<usize> = IndexSet::new();
        seen.insert(0);
        let mut queue: VecDeque<usize> = VecDeque::new();
        queue.push_back(0);
        while let Some(current) = queue.pop_front() {
            if self.pair_is_ambiguous(current) {
                let pair = &self.states[current];
                witnesses.push((
                    self.nfa.states[pair.a].config.clone(),
                    self.nfa.states[pair.b].config.clone(),
                ));
            }
            for dests in self.states[current].transitions.values() {
                for &dest in dests {
                    if seen.insert(dest) {
                        queue.push_back(dest);
                    }
                }
            }
        }
        witnesses
    }

    /// Approximate analysis over this product's regex; see
    /// [`approximate_ambiguity`].
    pub fn might_be_ambiguous(&self) -> Result<bool, Error> {
        approximate_ambiguity(&self.nfa.regex)
    }
}

// ---------------------------------------------------------------------------
// Approximate analysis
// ---------------------------------------------------------------------------

/// Byte spans of every counter occurrence (`{m}`, `{m,n}`, `{m,}`) in the
/// regex text, left to right.
fn counter_spans(regex: &str) -> Vec<std::ops::Range<usize>> {
    fn is_counter_body(body: &str) -> bool {
        let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
        match body.split_once(',') {
            None => all_digits(body),
            Some((lo, hi)) => all_digits(lo) && (hi.is_empty() || all_digits(hi)),
        }
    }
    let mut spans = Vec::new();
    let bytes = regex.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(close) = bytes[i + 1..].iter().position(|&b| b == b'}') {
                let end = i + 1 + close;
                if is_counter_body(&regex[i + 1..end]) {
                    spans.push(i..end + 1);
                    i = end + 1;
                    continue;
                }
            }
        }
        i += 1;
    }
    spans
}

/// The approximate regex for occurrence `keep`: every other counter
/// occurrence is widened to an unbounded `*`.
fn approximate_regex(regex: &str, spans: &[std::ops::Range<usize>], keep: usize) -> String {
    let mut out = String::with_capacity(regex.len());
    let mut last = 0;
    for (i, span) in spans.iter().enumerate() {
        out.push_str(&regex[last..span.start]);
        if i == keep {
            out.push_str(&regex[span.clone()]);
        } else {
            out.push('*');
        }
        last = span.end;
    }
    out.push_str(&regex[last..]);
    out
}

/// Approximate, cheaper ambiguity check: for each counter occurrence,
/// widen every *other* occurrence to `*` and run the exact analysis on the
/// result.
///
/// Returns `Ok(false)` ("definitely not ambiguous") only when at most one
/// approximate regex was checked, i.e. the regex has a single counter
/// occurrence that the exact analysis cleared.  With several occurrences
/// the answer is `Ok(true)` ("may be ambiguous") whether or not any
/// approximate regex was ambiguous: the widening is a one-sided
/// over-approximation, claimed (not proven) never to hide ambiguity.
///
/// Precondition: the regex contains at least one counter occurrence;
/// otherwise `Err(Error::MissingCounter)` before any work is done.
pub fn approximate_ambiguity(regex: &str) -> Result<bool, Error> {
    let spans = counter_spans(regex);
    if spans.is_empty() {
        return Err(Error::MissingCounter);
    }
    for keep in 0..spans.len() {
        let approx = approximate_regex(regex, &spans, keep);
        let nca = Nca::build(&approx)?;
        let nfa = Nfa::unfold(&nca);
        if ProductNfa::new(&nfa).is_ambiguous() {
            return Ok(true);
        }
    }
    Ok(spans.len() > 1)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::Itertools;

    fn build_nfa(regex: &str) -> Nfa {
        let nca = Nca::build(regex).unwrap();
        Nfa::unfold(&nca)
    }

    /// All words over `alphabet` up to `max_len`, empty word included.
    fn words(alphabet: &[char], max_len: usize) -> Vec<String> {
        let mut out = vec![String::new()];
        for len in 1..=max_len {
            for word in std::iter::repeat(alphabet.iter())
                .take(len)
                .multi_cartesian_product()
            {
                out.push(word.into_iter().collect());
            }
        }
        out
    }

    /// Fullmatch agreement with the `regex` crate over a word corpus.
    fn assert_matches_regex_crate(pattern: &str, alphabet: &[char], max_len: usize) {
        let nfa = build_nfa(pattern);
        let oracle = regex::Regex::new(&format!("^(?:{})$", pattern)).unwrap();
        for input in words(alphabet, max_len) {
            assert_eq!(
                nfa.try_match(&input),
                oracle.is_match(&input),
                "pattern {:?}, input {:?}",
                pattern,
                input
            );
        }
    }

    #[test]
    fn scanner_positions_and_quantifiers() {
        let mut scanner = Scanner::new("a[bc]{2,3}d*");
        let mut tokens = Vec::new();
        while let Some(token) = scanner.next_token().unwrap() {
            tokens.push(token);
        }
        assert_eq!(tokens.len(), 5);
        assert_eq!(tokens[0].id, StateIdx(1));
        assert!(matches!(tokens[0].kind, TokenKind::Literal));
        assert_eq!(tokens[1].id, StateIdx(2));
        assert_eq!(tokens[1].symbol, "[bc]");
        assert!(matches!(tokens[1].kind, TokenKind::Class(_)));
        match tokens[2].kind {
            TokenKind::Counter(range) => {
                assert_eq!(range.id, QuantId(1));
                assert_eq!(range.lower, 2);
                assert_eq!(range.upper, Some(3));
            }
            ref other => panic!("expected a counter, got {:?}", other),
        }
        assert_eq!(tokens[3].id, StateIdx(3));
        // Stars and counters share one id sequence.
        assert!(matches!(tokens[4].kind, TokenKind::Star(QuantId(2))));
    }

    #[test]
    fn scanner_unbounded_counter_sentinel() {
        let mut scanner = Scanner::new("a{2,}");
        scanner.next_token().unwrap();
        let token = scanner.next_token().unwrap().unwrap();
        match token.kind {
            TokenKind::Counter(range) => {
                assert_eq!(range.lower, 2);
                assert_eq!(range.upper, None);
            }
            ref other => panic!("expected a counter, got {:?}", other),
        }
    }

    #[test]
    fn scan_and_parse_errors() {
        assert_eq!(Nca::build("[ab").unwrap_err(), Error::UnterminatedClass);
        assert_eq!(Nca::build("a{2").unwrap_err(), Error::UnterminatedCounter);
        assert_eq!(Nca::build("ab\\").unwrap_err(), Error::DanglingEscape);
        assert_eq!(
            Nca::build("a{x}").unwrap_err(),
            Error::InvalidCounter("{x}".to_string())
        );
        assert_eq!(
            Nca::build("a{2,x}").unwrap_err(),
            Error::InvalidCounter("{2,x}".to_string())
        );
        assert_eq!(Nca::build("(a").unwrap_err(), Error::UnbalancedGroup);
        assert_eq!(Nca::build("a)").unwrap_err(), Error::UnbalancedGroup);
        assert_eq!(Nca::build("*a").unwrap_err(), Error::MissingOperand);
        assert_eq!(Nca::build("").unwrap_err(), Error::MissingOperand);
        assert!(matches!(Nca::build("[b-a]").unwrap_err(), Error::InvalidClass(_)));
    }

    #[test]
    fn escaped_metacharacter_is_literal() {
        let nfa = build_nfa("\\*a");
        assert!(nfa.try_match("*a"));
        assert!(!nfa.try_match("aa"));
    }

    #[test]
    fn predefined_classes() {
        let nfa = build_nfa("\\d{2}");
        assert!(nfa.try_match("42"));
        assert!(!nfa.try_match("4a"));
        assert!(!nfa.try_match("4"));

        // `\v` is vertical whitespace, not a vertical-tab literal.
        let nfa = build_nfa("\\v");
        assert!(nfa.try_match("\u{0B}"));
        assert!(nfa.try_match("\n"));
        assert!(!nfa.try_match("v"));
        let nfa = build_nfa("\\V");
        assert!(nfa.try_match("v"));
        assert!(!nfa.try_match("\n"));
    }

    #[test]
    fn nullable_counter_relaxes_lower_bound() {
        // The operand of {2,3} is nullable, so the written lower bound is
        // unenforceable and gets relaxed to 0 in the counter table.
        let sets_and_tokens = compute_sets("(a*){2,3}").unwrap();
        let range = sets_and_tokens.counters[&QuantId(2)];
        assert_eq!(range.lower, 0);
        assert_eq!(range.upper, Some(3));

        let nfa = build_nfa("(a*){2,3}");
        assert!(nfa.try_match(""));
        assert!(nfa.try_match("a"));
        assert!(nfa.try_match("aaaa"));
    }

    #[test]
    fn nullability() {
        assert!(build_nfa("a*").try_match(""));
        assert!(build_nfa("a{0,2}").try_match(""));
        assert!(!build_nfa("a{2,3}").try_match(""));
        assert!(build_nfa("a|b*").try_match(""));
    }

    #[test]
    fn nca_state_count() {
        // One state per position plus the start state.
        assert_eq!(Nca::build(".*a{2}").unwrap().state_count(), 3);
        assert_eq!(Nca::build("(ab){2}").unwrap().state_count(), 3);
    }

    #[test]
    fn state_arenas_index_by_id() {
        // Both arenas are frozen boxed slices so the newtype Index impls
        // on the slice types apply.
        let nca = Nca::build("a{2,3}").unwrap();
        assert!(nca.states[StateIdx::START].is_start);
        assert_eq!(nca.states[StateIdx(1)].token.symbol, "a");
        assert!(nca.states[StateIdx(1)].is_final);
        let nfa = Nfa::unfold(&nca);
        assert_eq!(nfa.states[nfa.start].config.state, StateIdx::START);
    }

    #[test]
    fn nca_display() {
        let nca = Nca::build("a{2,3}").unwrap();
        let rendered = nca.to_string();
        assert!(rendered.contains("(id=0, symbol=)"));
        assert!(rendered.contains("(c_id=1, range={2, 3})"));
        assert!(rendered.contains("less than its upper bound"));
    }

    #[test]
    fn unfold_reachable_configurations() {
        // .*a{2}: root, the dot loop, and the a-position at counts 1, 2.
        let nca = Nca::build(".*a{2}").unwrap();
        let nfa = Nfa::unfold(&nca);
        assert_eq!(nfa.state_count(), 4);
        // NFA ids start past the NCA id space.
        assert!(nfa.to_string().contains("(id=3, config={s_id=0"));
    }

    #[test]
    fn unfold_counter_values_stay_bounded() {
        let nfa = build_nfa("(a{2,3}){2,3}");
        for state in nfa.states.iter() {
            for (_, &value) in &state.config.counters {
                assert!(value >= 1 && value <= 3, "stray counter value {}", value);
            }
        }
    }

    #[test]
    fn unfold_state_limit() {
        let nca = Nca::build(".*a{2}").unwrap();
        assert_eq!(
            Nfa::unfold_bounded(&nca, 2).unwrap_err(),
            Error::StateLimit(2)
        );
        assert!(Nfa::unfold_bounded(&nca, 4).is_ok());
    }

    #[test]
    fn matches_counter() {
        assert_matches_regex_crate("a{2,3}", &['a'], 5);
    }

    #[test]
    fn matches_grouped_counter() {
        assert_matches_regex_crate("(ab){2}", &['a', 'b'], 6);
    }

    #[test]
    fn matches_alternation_under_counter() {
        assert_matches_regex_crate("(a|bc){1,2}", &['a', 'b', 'c'], 4);
    }

    #[test]
    fn matches_class_counter() {
        assert_matches_regex_crate("[0-9]{2}", &['0', '5', '9', 'a'], 3);
    }

    #[test]
    fn matches_dotstar_prefix() {
        assert_matches_regex_crate(".*abc", &['a', 'b', 'c'], 5);
    }

    #[test]
    fn matches_nested_counters() {
        assert_matches_regex_crate("(a{2,3}){2,3}", &['a'], 10);
    }

    #[test]
    fn matches_counter_alternation() {
        assert_matches_regex_crate(".*(ab{3}|cd{3})", &['a', 'b', 'c', 'd'], 5);
    }

    #[test]
    fn counter_at_upper_bound_blocks_forward_exit() {
        // The forward edge out of a counted position requires headroom
        // below the upper bound, so exiting at exactly the upper bound is
        // only possible through finalization, not through a continuation.
        // Backtracking engines accept "aaab" here.
        let nfa = build_nfa("a{2,3}b");
        assert!(nfa.try_match("aab"));
        assert!(!nfa.try_match("aaab"));
    }

    #[test]
    fn rewritten_plus_is_equivalent() {
        // The front end rewrites `a+` to `(aa*)`; both automata must
        // accept the same language as plain `aa*`.
        let rewritten = build_nfa("(aa*)");
        let reference = build_nfa("aa*");
        for input in words(&['a', 'b'], 4) {
            assert_eq!(rewritten.try_match(&input), reference.try_match(&input));
        }
    }

    #[test]
    fn unambiguous_single_counter() {
        let nfa = build_nfa(".*a{2}");
        let product = ProductNfa::new(&nfa);
        assert!(!product.is_ambiguous());
        assert_eq!(product.might_be_ambiguous(), Ok(false));
    }

    #[test]
    fn ambiguous_star_counter_overlap() {
        // After "aa", the a-position is reachable with count 1 (one loop
        // through the star) and with count 2 (straight into the counter).
        let nfa = build_nfa("a*a{2}");
        let product = ProductNfa::new(&nfa);
        assert!(product.is_ambiguous());
        let witnesses = product.find_ambiguities();
        assert!(!witnesses.is_empty());
        for (left, right) in &witnesses {
            assert_eq!(left.state, right.state);
            assert_ne!(left.counters, right.counters);
        }
        assert_eq!(product.might_be_ambiguous(), Ok(true));
    }

    #[test]
    fn approximation_is_one_sided() {
        // Exactly unambiguous, but two counter occurrences force the
        // approximate analysis to stay on the safe side.
        let nfa = build_nfa(".*(ab{3}|cd{3})");
        let product = ProductNfa::new(&nfa);
        assert!(!product.is_ambiguous());
        assert_eq!(product.might_be_ambiguous(), Ok(true));
    }

    #[test]
    fn approximation_requires_a_counter() {
        assert_eq!(approximate_ambiguity("abc"), Err(Error::MissingCounter));
    }

    #[test]
    fn exact_ambiguity_implies_approximate() {
        let patterns = [
            "a{2,3}",
            ".*a{2}",
            "a*a{2}",
            "(ab){2}",
            "(a{2,3}){2,3}",
            ".*(ab{3}|cd{3})",
            "(a|b)*a{3}",
        ];
        for pattern in patterns {
            let nfa = build_nfa(pattern);
            let product = ProductNfa::new(&nfa);
            if product.is_ambiguous() {
                assert_eq!(
                    product.might_be_ambiguous(),
                    Ok(true),
                    "pattern {:?}",
                    pattern
                );
            }
        }
    }

    #[test]
    fn counter_span_scanning() {
        let spans = counter_spans("a{2}(b{3,}|c{1,4}){x}");
        let texts: Vec<&str> = spans
            .iter()
            .map(|s| &"a{2}(b{3,}|c{1,4}){x}"[s.clone()])
            .collect();
        assert_eq!(texts, vec!["{2}", "{3,}", "{1,4}"]);

        let spans = counter_spans("a{2}b{3}");
        assert_eq!(approximate_regex("a{2}b{3}", &spans, 0), "a{2}b*");
        assert_eq!(approximate_regex("a{2}b{3}", &spans, 1), "a*b{3}");
    }

    #[test]
    fn dot_output() {
        let dot = build_nfa("a{2,3}").to_dot();
        assert!(dot.starts_with("digraph nfa {"));
        assert!(dot.contains("peripheries=2"));
        assert!(dot.contains("[label=\"a\"]"));
    }
}
