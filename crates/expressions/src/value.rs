//! The canonical value universe of the expression evaluator: six kinds, with
//! collections accessed through narrow read-only capability traits so that
//! external representations (template tokens, host documents) participate
//! without being deep-copied into an internal form.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use fxhash::FxHashMap;

use crate::budget::{string_bytes, MIN_OBJECT_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Null,
    Boolean,
    Number,
    String,
    Array,
    Object,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::Null => "Null",
            Kind::Boolean => "Boolean",
            Kind::Number => "Number",
            Kind::String => "String",
            Kind::Array => "Array",
            Kind::Object => "Object",
        };
        f.write_str(name)
    }
}

/// ArrayCompat is the array capability: length and O(1) access by index.
pub trait ArrayCompat: fmt::Debug {
    fn len(&self) -> usize;
    fn item(&self, index: usize) -> Option<Value>;

    /// Wildcard traversal produces transient filtered arrays which cascade
    /// differently from real arrays; everything else reports `None`.
    fn as_filtered(&self) -> Option<&FilteredArray> {
        None
    }
}

/// ObjectCompat is the object capability: case-insensitive keyed access
/// preserving insertion order.
pub trait ObjectCompat: fmt::Debug {
    fn len(&self) -> usize;
    fn has(&self, key: &str) -> bool;
    fn item(&self, key: &str) -> Option<Value>;
    fn keys(&self) -> Vec<Rc<str>>;
}

#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Boolean(bool),
    Number(f64),
    String(Rc<str>),
    Array(Rc<dyn ArrayCompat>),
    Object(Rc<dyn ObjectCompat>),
}

impl Value {
    pub fn string(s: impl AsRef<str>) -> Self {
        Value::String(Rc::from(s.as_ref()))
    }

    pub fn kind(&self) -> Kind {
        match self {
            Value::Null => Kind::Null,
            Value::Boolean(_) => Kind::Boolean,
            Value::Number(_) => Kind::Number,
            Value::String(_) => Kind::String,
            Value::Array(_) => Kind::Array,
            Value::Object(_) => Kind::Object,
        }
    }

    pub fn is_primitive(&self) -> bool {
        !matches!(self, Value::Array(_) | Value::Object(_))
    }

    /// Falsy values are null, false, 0, NaN and the empty string.
    /// Collections are always truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Boolean(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) => true,
        }
    }

    pub fn to_number(&self) -> f64 {
        match self {
            Value::Null => 0.0,
            Value::Boolean(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::Number(n) => *n,
            Value::String(s) => parse_number(s),
            Value::Array(_) | Value::Object(_) => f64::NAN,
        }
    }

    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Boolean(b) => b.to_string(),
            Value::Number(n) => number_to_string(*n),
            Value::String(s) => s.to_string(),
            Value::Array(_) => "Array".to_string(),
            Value::Object(_) => "Object".to_string(),
        }
    }

    pub fn as_array(&self) -> Option<&Rc<dyn ArrayCompat>> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Rc<dyn ObjectCompat>> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Head cost of this value: the string approximation for strings,
    /// the flat aggregate cost for everything else.
    pub fn shallow_bytes(&self) -> usize {
        match self {
            Value::String(s) => string_bytes(s),
            _ => MIN_OBJECT_SIZE,
        }
    }

    /// Full cost of this value and everything reachable from it.
    pub fn deep_bytes(&self) -> usize {
        match self {
            Value::Array(a) => {
                let mut total = MIN_OBJECT_SIZE;
                for i in 0..a.len() {
                    if let Some(item) = a.item(i) {
                        total += item.deep_bytes();
                    }
                }
                total
            }
            Value::Object(o) => {
                let mut total = MIN_OBJECT_SIZE;
                for key in o.keys() {
                    total += string_bytes(&key);
                    if let Some(item) = o.item(&key) {
                        total += item.deep_bytes();
                    }
                }
                total
            }
            other => other.shallow_bytes(),
        }
    }

    /// Deep conversion to a serde_json tree. NaN and infinities have no
    /// JSON form and collapse to null.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.to_string()),
            Value::Array(a) => {
                let items = (0..a.len())
                    .map(|i| a.item(i).unwrap_or(Value::Null).to_json())
                    .collect();
                serde_json::Value::Array(items)
            }
            Value::Object(o) => {
                let mut map = serde_json::Map::new();
                for key in o.keys() {
                    let item = o.item(&key).unwrap_or(Value::Null);
                    map.insert(key.to_string(), item.to_json());
                }
                serde_json::Value::Object(map)
            }
        }
    }

    /// Deep conversion from a serde_json tree.
    pub fn from_json(json: &serde_json::Value) -> Self {
        Self::from_json_counted(json).0
    }

    /// As `from_json`, also reporting the total byte cost of the result.
    pub fn from_json_counted(json: &serde_json::Value) -> (Self, usize) {
        match json {
            serde_json::Value::Null => (Value::Null, MIN_OBJECT_SIZE),
            serde_json::Value::Bool(b) => (Value::Boolean(*b), MIN_OBJECT_SIZE),
            serde_json::Value::Number(n) => {
                (Value::Number(n.as_f64().unwrap_or(f64::NAN)), MIN_OBJECT_SIZE)
            }
            serde_json::Value::String(s) => (Value::string(s), string_bytes(s)),
            serde_json::Value::Array(items) => {
                let mut total = MIN_OBJECT_SIZE;
                let mut array = ArrayData::new();
                for item in items {
                    let (value, bytes) = Self::from_json_counted(item);
                    total += bytes;
                    array.push(value);
                }
                (Value::Array(Rc::new(array)), total)
            }
            serde_json::Value::Object(map) => {
                let mut total = MIN_OBJECT_SIZE;
                let mut object = ObjectData::new();
                for (key, item) in map {
                    let (value, bytes) = Self::from_json_counted(item);
                    total += string_bytes(key) + bytes;
                    object.insert(key, value);
                }
                (Value::Object(Rc::new(object)), total)
            }
        }
    }
}

/// ref_equals reports whether two values are the same collection instance.
/// Primitives are never reference-equal.
pub fn ref_equals(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
        (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
        _ => false,
    }
}

/// ArrayData is the owned array representation.
#[derive(Debug, Default)]
pub struct ArrayData {
    items: Vec<Value>,
}

impl ArrayData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: Value) {
        self.items.push(value);
    }
}

impl From<Vec<Value>> for ArrayData {
    fn from(items: Vec<Value>) -> Self {
        Self { items }
    }
}

impl ArrayCompat for ArrayData {
    fn len(&self) -> usize {
        self.items.len()
    }

    fn item(&self, index: usize) -> Option<Value> {
        self.items.get(index).cloned()
    }
}

/// ObjectData is the owned object representation: insertion-ordered pairs
/// with a lazily built upper-cased index for case-insensitive lookup.
#[derive(Debug, Default)]
pub struct ObjectData {
    pairs: Vec<(Rc<str>, Value)>,
    index: RefCell<Option<FxHashMap<String, usize>>>,
}

impl ObjectData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pair. A key which already exists under case-insensitive
    /// comparison has its value replaced in place, retaining the original
    /// key spelling and position.
    pub fn insert(&mut self, key: &str, value: Value) {
        if let Some(at) = self.lookup(key) {
            self.pairs[at].1 = value;
            return;
        }
        self.pairs.push((Rc::from(key), value));
        if let Some(map) = self.index.borrow_mut().as_mut() {
            map.insert(key.to_uppercase(), self.pairs.len() - 1);
        }
    }

    fn lookup(&self, key: &str) -> Option<usize> {
        let mut index = self.index.borrow_mut();
        let map = index.get_or_insert_with(|| {
            self.pairs
                .iter()
                .enumerate()
                .map(|(at, (k, _))| (k.to_uppercase(), at))
                .collect()
        });
        map.get(&key.to_uppercase()).copied()
    }
}

impl ObjectCompat for ObjectData {
    fn len(&self) -> usize {
        self.pairs.len()
    }

    fn has(&self, key: &str) -> bool {
        self.lookup(key).is_some()
    }

    fn item(&self, key: &str) -> Option<Value> {
        self.lookup(key).map(|at| self.pairs[at].1.clone())
    }

    fn keys(&self) -> Vec<Rc<str>> {
        self.pairs.iter().map(|(k, _)| k.clone()).collect()
    }
}

/// FilteredArray is the transient array produced by a wildcard index. It is
/// a real array for every purpose except wildcard cascading, which flattens
/// through it instead of nesting.
#[derive(Debug, Default)]
pub struct FilteredArray {
    items: Vec<Value>,
}

impl FilteredArray {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: Value) {
        self.items.push(value);
    }

    pub fn values(&self) -> &[Value] {
        &self.items
    }
}

impl ArrayCompat for FilteredArray {
    fn len(&self) -> usize {
        self.items.len()
    }

    fn item(&self, index: usize) -> Option<Value> {
        self.items.get(index).cloned()
    }

    fn as_filtered(&self) -> Option<&FilteredArray> {
        Some(self)
    }
}

/// parse_number applies JavaScript `Number()` semantics to a string:
/// surrounding whitespace is ignored, the empty string is zero, hex /
/// octal / binary prefixes and signed infinities are recognized, and
/// anything else that fails a decimal parse is NaN.
pub fn parse_number(s: &str) -> f64 {
    let t = s.trim();
    if t.is_empty() {
        return 0.0;
    }
    match t {
        "Infinity" | "+Infinity" => return f64::INFINITY,
        "-Infinity" => return f64::NEG_INFINITY,
        _ => {}
    }
    if let Some(rest) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        return i64::from_str_radix(rest, 16).map_or(f64::NAN, |v| v as f64);
    }
    if let Some(rest) = t.strip_prefix("0o").or_else(|| t.strip_prefix("0O")) {
        return i64::from_str_radix(rest, 8).map_or(f64::NAN, |v| v as f64);
    }
    if let Some(rest) = t.strip_prefix("0b").or_else(|| t.strip_prefix("0B")) {
        return i64::from_str_radix(rest, 2).map_or(f64::NAN, |v| v as f64);
    }
    // Reject textual forms the Rust parser accepts but Number() does not
    // ("inf", "nan"), by requiring a digit and decimal-literal characters.
    if !t.contains(|c: char| c.is_ascii_digit())
        || !t
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'))
    {
        return f64::NAN;
    }
    t.parse::<f64>().unwrap_or(f64::NAN)
}

/// number_to_string renders a number the way the expression language
/// displays it: NaN and infinities literally, negative zero as "0", and
/// integral doubles without a fractional part.
pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if n == 0.0 {
        return "0".to_string();
    }
    if n.fract() == 0.0 {
        if n.abs() <= 9_007_199_254_740_992.0 {
            return format!("{}", n as i64);
        }
        return format!("{:.0}", n);
    }
    format!("{}", n)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Boolean(false).is_truthy());
        assert!(!Value::Number(0.0).is_truthy());
        assert!(!Value::Number(-0.0).is_truthy());
        assert!(!Value::Number(f64::NAN).is_truthy());
        assert!(!Value::string("").is_truthy());

        assert!(Value::Boolean(true).is_truthy());
        assert!(Value::Number(0.5).is_truthy());
        assert!(Value::string("false").is_truthy());
        assert!(Value::Array(Rc::new(ArrayData::new())).is_truthy());
        assert!(Value::Object(Rc::new(ObjectData::new())).is_truthy());
    }

    #[test]
    fn number_parsing() {
        assert_eq!(parse_number(""), 0.0);
        assert_eq!(parse_number("  \t "), 0.0);
        assert_eq!(parse_number("12"), 12.0);
        assert_eq!(parse_number(" -1.5e2 "), -150.0);
        assert_eq!(parse_number("0xff"), 255.0);
        assert_eq!(parse_number("0b101"), 5.0);
        assert_eq!(parse_number("Infinity"), f64::INFINITY);
        assert_eq!(parse_number("-Infinity"), f64::NEG_INFINITY);
        assert!(parse_number("inf").is_nan());
        assert!(parse_number("nan").is_nan());
        assert!(parse_number("12abc").is_nan());
    }

    #[test]
    fn number_display() {
        assert_eq!(number_to_string(0.0), "0");
        assert_eq!(number_to_string(-0.0), "0");
        assert_eq!(number_to_string(7.0), "7");
        assert_eq!(number_to_string(-3.0), "-3");
        assert_eq!(number_to_string(1.5), "1.5");
        assert_eq!(number_to_string(f64::NAN), "NaN");
        assert_eq!(number_to_string(f64::INFINITY), "Infinity");
        assert_eq!(number_to_string(f64::NEG_INFINITY), "-Infinity");
    }

    #[test]
    fn object_lookup_is_case_insensitive_and_ordered() {
        let mut o = ObjectData::new();
        o.insert("Alpha", Value::Number(1.0));
        o.insert("beta", Value::Number(2.0));
        assert!(o.has("ALPHA"));
        assert!(o.has("Beta"));
        assert!(!o.has("gamma"));

        // Case-insensitive replacement keeps the original spelling and slot.
        o.insert("ALPHA", Value::Number(9.0));
        let keys: Vec<String> = o.keys().iter().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["Alpha", "beta"]);
        assert!(matches!(o.item("alpha"), Some(Value::Number(n)) if n == 9.0));
    }

    #[test]
    fn json_round_trip_counts_bytes() {
        let json = serde_json::json!({"a": 1, "b": [true, null, "x"]});
        let (value, bytes) = Value::from_json_counted(&json);
        assert!(bytes > 0);
        assert_eq!(value.to_json(), json);
    }
}
