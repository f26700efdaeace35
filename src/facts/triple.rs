//! Stable fact keys and a conservative (subject, relation, object) parser.
//!
//! The parser prefers no detection over false positives: only relations that
//! are typically single-valued produce a slot key, and unknown relations
//! never cause conflicts. Works best on short Chinese/English factual
//! statements.

/// Whitespace-fold and lowercase; keys compare equal modulo this.
pub fn normalize_fact_key(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Subject phrase of a free-text fact: the prefix before the first "就是",
/// or failing that the first "是". Empty when the fact has no clear subject.
pub fn extract_fact_subject(fact: &str) -> &str {
    let fact = fact.trim();
    if let Some(i) = fact.find("就是") {
        if i > 0 {
            return fact[..i].trim();
        }
    }
    if let Some(i) = fact.find('是') {
        if i > 0 {
            return fact[..i].trim();
        }
    }
    ""
}

/// Stable key for a fact: `subject:<normalized subject>` when a subject
/// exists, otherwise the normalized full text. Used everywhere a fact is
/// keyed so that rephrasings of the same subject collide.
pub fn derive_fact_key(content: &str) -> String {
    let content = content.trim();
    if content.is_empty() {
        return String::new();
    }
    let subject = extract_fact_subject(content);
    if subject.is_empty() {
        normalize_fact_key(content)
    } else {
        format!("subject:{}", normalize_fact_key(subject))
    }
}

/// Canonical relations treated as single-valued slots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FactTriple {
    pub subject: String,
    pub relation: String,
    pub object: String,
    pub subject_key: String,
    pub relation_key: String,
    pub single_valued: bool,
}

impl FactTriple {
    /// `slot:<subject>|<relation>` for single-valued relations, else None.
    pub fn slot_key(&self) -> Option<String> {
        if !self.single_valued || self.subject_key.is_empty() || self.relation_key.is_empty() {
            return None;
        }
        Some(format!("slot:{}|{}", self.subject_key, self.relation_key))
    }
}

const SLOT_ATTRS: &[&str] = &[
    "名字", "姓名", "真名", "昵称", "英文名", "ID", "邮箱", "手机号", "电话", "生日",
    "出生日期", "年龄", "住址", "地址", "所在地", "公司", "职位", "职务",
];

/// Parse a natural-language fact into a triple. Returns the default (empty)
/// triple when parsing is not confident enough.
pub fn extract_fact_triple(fact: &str) -> FactTriple {
    let fact = fact.trim();
    if fact.is_empty() {
        return FactTriple::default();
    }
    let fact = fact.trim_end_matches(['。', '.', '!', '！', '?', '？', ' ']);
    let fact = fact.split_whitespace().collect::<Vec<_>>().join(" ");

    // "<subj>的<attr>是<obj>"  e.g. 娜娜的真名是刘娜
    if let Some((s, r, o)) = parse_chinese_possessive_is(&fact) {
        return finalize(s, r, o);
    }
    // "<subj><attr>是<obj>"  e.g. 娜娜真名是刘娜
    if let Some((s, r, o)) = parse_chinese_attribute_is(&fact) {
        return finalize(s, r, o);
    }
    // "<subj>名叫/叫做/就是/是/为/叫<obj>"
    if let Some((s, r, o)) = parse_chinese_direct(&fact) {
        return finalize(s, r, o);
    }
    // "<subj>'s <attr> is <obj>" / "<subj> is <obj>"
    if let Some((s, r, o)) = parse_english(&fact) {
        return finalize(s, r, o);
    }

    FactTriple::default()
}

fn finalize(subject: String, relation: String, object: String) -> FactTriple {
    let mut subject = subject.trim().to_string();
    let relation = relation.trim().to_string();
    let object = object.trim().to_string();
    if subject.is_empty() || relation.is_empty() || object.is_empty() {
        return FactTriple::default();
    }

    // Fold leading possessives so 我的/你的 key as 我/你.
    if subject.starts_with("我的") {
        subject = "我".into();
    } else if subject.starts_with("你的") {
        subject = "你".into();
    }
    let strip_quotes = |s: &str| s.trim_matches(['"', '\'', '“', '”', '‘', '’', ' ']).to_string();
    let subject = strip_quotes(&subject);
    let object = strip_quotes(&object);

    let Some((canon, single)) = canonical_relation(&relation) else {
        return FactTriple::default();
    };

    FactTriple {
        subject_key: normalize_fact_key(&subject),
        relation_key: canon.to_string(),
        subject,
        relation,
        object,
        single_valued: single,
    }
}

/// Map a surface relation onto the closed canonical set. Unknown relations
/// return None and never form slots.
fn canonical_relation(relation: &str) -> Option<(&'static str, bool)> {
    let r = relation.trim().to_lowercase().replace('：', ":");
    let has = |subs: &[&str]| subs.iter().any(|s| r.contains(s));

    // Chinese
    if has(&["名字", "姓名", "真名", "昵称", "英文名"]) {
        return Some(("name", true));
    }
    if has(&["id", "账号", "用户名"]) {
        return Some(("id", true));
    }
    if has(&["名叫", "叫做"]) || (r.contains('叫') && !r.contains("喜欢")) {
        return Some(("name", true));
    }
    if r.contains("邮箱") {
        return Some(("email", true));
    }
    if has(&["手机号", "手机", "电话"]) {
        return Some(("phone", true));
    }
    if has(&["生日", "出生"]) {
        return Some(("birthday", true));
    }
    if r.contains("年龄") {
        return Some(("age", true));
    }
    if has(&["住址", "地址", "住在", "所在地"]) {
        return Some(("location", true));
    }
    if has(&["公司", "工作", "任职", "职位", "职务"]) {
        return Some(("job", true));
    }
    // English
    if r.contains("name") {
        return Some(("name", true));
    }
    if has(&["email", "e-mail", "mail"]) {
        return Some(("email", true));
    }
    if has(&["phone", "tel"]) {
        return Some(("phone", true));
    }
    if has(&["birthday", "born"]) {
        return Some(("birthday", true));
    }
    if r.contains("age") {
        return Some(("age", true));
    }
    if has(&["live", "location", "address"]) {
        return Some(("location", true));
    }
    if has(&["work", "company", "job", "title"]) {
        return Some(("job", true));
    }
    if matches!(r.as_str(), "是" | "就是" | "为" | "is" | "are") {
        return Some(("identity", true));
    }
    None
}

type Parsed = (String, String, String);

fn parse_chinese_possessive_is(s: &str) -> Option<Parsed> {
    if !s.contains('的') {
        return None;
    }
    for attr in SLOT_ATTRS {
        let needle = format!("的{attr}");
        let Some(idx) = s.find(&needle) else { continue };
        if idx == 0 {
            continue;
        }
        let rest = &s[idx + needle.len()..];
        let (sep, sep_idx) = if let Some(i) = rest.find('是') {
            ("是", i)
        } else if let Some(i) = rest.find('为') {
            ("为", i)
        } else {
            continue;
        };
        let subject = s[..idx].trim();
        let object = rest[sep_idx + sep.len()..].trim();
        if !subject.is_empty() && !object.is_empty() {
            return Some((subject.into(), format!("{attr}{sep}"), object.into()));
        }
    }
    None
}

fn parse_chinese_attribute_is(s: &str) -> Option<Parsed> {
    for attr in SLOT_ATTRS {
        let needle = format!("{attr}是");
        let Some(idx) = s.find(&needle) else { continue };
        if idx == 0 {
            continue;
        }
        let subject = s[..idx].trim().trim_end_matches('的').trim();
        let object = s[idx + needle.len()..].trim();
        if !subject.is_empty() && !object.is_empty() {
            return Some((subject.into(), needle, object.into()));
        }
    }
    None
}

fn parse_chinese_direct(s: &str) -> Option<Parsed> {
    // ordered by specificity
    for sep in ["名叫", "叫做", "就是", "是", "为", "叫"] {
        let Some(idx) = s.find(sep) else { continue };
        if idx == 0 {
            continue;
        }
        let subject = s[..idx].trim();
        let object = s[idx + sep.len()..].trim();
        if subject.is_empty() || object.is_empty() {
            continue;
        }
        return Some((subject.into(), sep.into(), object.into()));
    }
    None
}

fn parse_english(s: &str) -> Option<Parsed> {
    let ls = s.to_lowercase();

    // possessive: "X's name is Y"
    if let Some(i) = ls.find("'s ") {
        if i > 0 {
            let subject = s[..i].trim();
            let rest = &s[i + 3..];
            let rl = rest.to_lowercase();
            if let Some(j) = rl.find(" is ") {
                if j > 0 {
                    let relation = format!("{} is", rest[..j].trim());
                    let object = rest[j + 4..].trim();
                    if !subject.is_empty() && !object.is_empty() {
                        return Some((subject.into(), relation, object.into()));
                    }
                }
            }
        }
    }
    // direct: "X is Y" / "X are Y"
    for (sep, rel) in [(" is ", "is"), (" are ", "are")] {
        if let Some(i) = ls.find(sep) {
            if i > 0 {
                let subject = s[..i].trim();
                let object = s[i + sep.len()..].trim();
                if !subject.is_empty() && !object.is_empty() {
                    return Some((subject.into(), rel.into(), object.into()));
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fact_key_is_whitespace_and_case_stable() {
        let f = "My favorite Editor is Vim";
        assert_eq!(derive_fact_key(f), derive_fact_key(&format!("  {f}  ")));
        assert_eq!(derive_fact_key(f), derive_fact_key(&f.to_lowercase()));
    }

    #[test]
    fn fact_key_prefers_subject() {
        assert_eq!(derive_fact_key("我最喜欢的颜色是黄色"), "subject:我最喜欢的颜色");
        assert_eq!(derive_fact_key("记不住主语的一句话"), "记不住主语的一句话");
    }

    #[test]
    fn connective_priority() {
        // 就是 wins over a later 是
        assert_eq!(extract_fact_subject("小明就是我是谁里的主角"), "小明");
        // leading 是 never yields a subject
        assert_eq!(extract_fact_subject("是这样的"), "");
    }

    #[test]
    fn possessive_and_attribute_forms_share_a_slot() {
        let a = extract_fact_triple("娜娜的真名是刘娜");
        let b = extract_fact_triple("娜娜真名是王娜");
        assert_eq!(a.relation_key, "name");
        assert_eq!(a.slot_key(), b.slot_key());
        assert!(a.slot_key().is_some());
    }

    #[test]
    fn identity_relation_is_single_valued() {
        let t = extract_fact_triple("我是程序员");
        assert_eq!(t.relation_key, "identity");
        assert_eq!(t.slot_key().as_deref(), Some("slot:我|identity"));
    }

    #[test]
    fn possessive_subject_folds() {
        let t = extract_fact_triple("我的邮箱是a@b.c");
        assert_eq!(t.subject, "我");
        assert_eq!(t.relation_key, "email");
    }

    #[test]
    fn unknown_relation_has_no_slot() {
        let t = extract_fact_triple("我喜欢黄色");
        assert_eq!(t.slot_key(), None);
    }

    #[test]
    fn english_possessive_name() {
        let t = extract_fact_triple("Alice's name is Alice Zhang");
        assert_eq!(t.relation_key, "name");
        assert_eq!(t.subject, "Alice");
        assert_eq!(t.object, "Alice Zhang");
    }

    #[test]
    fn trailing_punctuation_ignored() {
        let a = extract_fact_triple("我是程序员。");
        let b = extract_fact_triple("我是程序员");
        assert_eq!(a.slot_key(), b.slot_key());
    }
}
