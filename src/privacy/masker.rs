//! 可逆实体脱敏
//!
//! 出站文本/数据在离开进程边界前，把实体类子串替换为稳定的计数型占位符
//! （ENTITY_001、ENTITY_002…，按首见顺序）；入站的展示文本再反向还原。
//! 实体识别用 jieba 分词 + 词性标注：人名/地名/机构名（nr/ns/nt）的短词段，
//! 外加姓氏开头的词典外短词段（HMM 拼出的人名常只拿到 x 标注），
//! 再经领域名词跳过列表过滤。会话级作用域，reset 清空双向映射与计数器。

use std::collections::{HashMap, HashSet};

use jieba_rs::Jieba;
use regex::Regex;

/// 双向映射 original ↔ token；同一原文在会话内恒得同一 token，
/// 一个 token 只对应一个原文。
#[derive(Debug, Default)]
pub struct MaskingTable {
    forward: HashMap<String, String>,
    reverse: HashMap<String, String>,
    counter: usize,
}

impl MaskingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取原文对应的 token，不存在则分配下一个计数型 token
    pub fn token_for(&mut self, original: &str) -> String {
        if let Some(token) = self.forward.get(original) {
            return token.clone();
        }
        self.counter += 1;
        let token = format!("ENTITY_{:03}", self.counter);
        self.forward.insert(original.to_string(), token.clone());
        self.reverse.insert(token.clone(), original.to_string());
        token
    }

    pub fn original_for(&self, token: &str) -> Option<&String> {
        self.reverse.get(token)
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    pub fn reset(&mut self) {
        self.forward.clear();
        self.reverse.clear();
        self.counter = 0;
    }

    /// token 按长度降序（长 token 先替换，避免前缀碰撞）
    fn tokens_longest_first(&self) -> Vec<(&String, &String)> {
        let mut entries: Vec<_> = self.reverse.iter().collect();
        entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then(a.0.cmp(b.0)));
        entries
    }
}

/// 会话级脱敏器
pub struct Masker {
    jieba: Jieba,
    table: MaskingTable,
    skip_words: HashSet<String>,
    preserve_keys: HashSet<String>,
    token_pattern: Regex,
    enabled: bool,
}

/// 实体词段的最大字符数（超过视为描述性短语而非实体）
const MAX_ENTITY_CHARS: usize = 4;

/// 常见姓氏：HMM 拼出的词典外人名往往只拿到 x 标注，
/// 姓氏开头的短表意词段按实体处理
const COMMON_SURNAMES: &str = "王李张刘陈杨黄赵吴周徐孙马朱胡郭何林罗高郑梁谢宋唐许韩冯邓\
                               曹彭曾肖田董袁潘蒋蔡余杜叶程苏魏吕丁任沈姚卢姜崔钟谭陆汪范金\
                               石廖贾夏韦付方白邹孟熊秦邱江尹薛闫段雷侯龙史陶黎贺顾毛郝龚邵\
                               万钱严覃武戴莫孔向汤";

fn is_ideographic(word: &str) -> bool {
    word.chars().all(|c| ('\u{4e00}'..='\u{9fff}').contains(&c))
}

impl Masker {
    pub fn new(
        skip_words: impl IntoIterator<Item = String>,
        preserve_keys: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            jieba: Jieba::new(),
            table: MaskingTable::new(),
            skip_words: skip_words.into_iter().collect(),
            preserve_keys: preserve_keys.into_iter().collect(),
            token_pattern: Regex::new(r"ENTITY_\d{3,}").unwrap(),
            enabled: true,
        }
    }

    /// 全程直通的脱敏器：mask/unmask 原样返回，映射表恒空
    pub fn disabled() -> Self {
        let mut masker = Self::new(Vec::new(), Vec::new());
        masker.enabled = false;
        masker
    }

    pub fn table(&self) -> &MaskingTable {
        &self.table
    }

    /// 清空会话映射与计数器
    pub fn reset(&mut self) {
        self.table.reset();
    }

    fn qualifies(&self, word: &str, tag: &str) -> bool {
        if self.skip_words.contains(word) {
            return false;
        }
        // 已是占位符的子串不重复脱敏（幂等）
        if self.token_pattern.is_match(word) {
            return false;
        }
        let chars = word.chars().count();
        if chars < 2 || chars > MAX_ENTITY_CHARS {
            return false;
        }
        // nr 人名 / ns 地名 / nt 机构名
        if matches!(&tag[..tag.len().min(2)], "nr" | "ns" | "nt") {
            return true;
        }
        // 词典外（x 标注）的姓氏开头短词段：HMM 拼出的人名拿不到 nr
        tag == "x"
            && chars <= 3
            && is_ideographic(word)
            && word
                .chars()
                .next()
                .is_some_and(|c| COMMON_SURNAMES.contains(c))
    }

    /// 脱敏：命中的实体按首见顺序替换为稳定 token
    pub fn mask(&mut self, text: &str) -> String {
        if !self.enabled {
            return text.to_string();
        }
        let tags = self.jieba.tag(text, true);
        let mut out = String::with_capacity(text.len());
        for t in tags {
            if self.qualifies(t.word, t.tag) {
                out.push_str(&self.table.token_for(t.word));
            } else {
                out.push_str(t.word);
            }
        }
        out
    }

    /// 递归脱敏结构化数据；preserve_keys 命中的键保留明文
    /// （自由文本备注、文件/列名等结构键，模型仍需据此推理）
    pub fn mask_context(&mut self, value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::String(s) => serde_json::Value::String(self.mask(s)),
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(|v| self.mask_context(v)).collect())
            }
            serde_json::Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    if self.preserve_keys.contains(k) {
                        out.insert(k.clone(), v.clone());
                    } else {
                        out.insert(k.clone(), self.mask_context(v));
                    }
                }
                serde_json::Value::Object(out)
            }
            other => other.clone(),
        }
    }

    /// 还原：把所有已知 token 替换回原文。只用于面向用户展示的文本，
    /// 仍留在脱敏会话内的文本不得还原。
    pub fn unmask(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (token, original) in self.table.tokens_longest_first() {
            if out.contains(token.as_str()) {
                out = out.replace(token.as_str(), original);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn masker() -> Masker {
        Masker::new(Vec::new(), Vec::new())
    }

    #[test]
    fn test_mask_names_first_seen_order() {
        let mut m = masker();
        let masked = m.mask("请核对张三和李四的账目");
        assert_eq!(masked, "请核对ENTITY_001和ENTITY_002的账目");
        assert_eq!(m.table().len(), 2);
    }

    #[test]
    fn test_unmask_restores_originals() {
        let mut m = masker();
        m.mask("请核对张三和李四的账目");
        assert_eq!(m.unmask("ENTITY_001 和 ENTITY_002"), "张三 和 李四");
    }

    #[test]
    fn test_round_trip_is_noop() {
        let mut m = masker();
        let original = "张三提交了李四的报销单";
        let masked = m.mask(original);
        assert_eq!(m.unmask(&masked), original);
    }

    #[test]
    fn test_stable_token_within_session() {
        let mut m = masker();
        let a = m.mask("张三");
        let b = m.mask("张三来了");
        assert!(a.contains("ENTITY_001"));
        assert!(b.contains("ENTITY_001"));
        assert_eq!(m.table().len(), 1);
    }

    #[test]
    fn test_skip_word_not_masked() {
        let mut m = Masker::new(vec!["张三".to_string()], Vec::new());
        assert_eq!(m.mask("张三的账目"), "张三的账目");
        // 跳过词上 mask 幂等
        assert_eq!(m.mask("张三的账目"), "张三的账目");
    }

    #[test]
    fn test_mask_idempotent_on_tokens() {
        let mut m = masker();
        let masked = m.mask("张三");
        let twice = m.mask(&masked);
        assert_eq!(masked, twice);
    }

    #[test]
    fn test_reset_clears_table_and_counter() {
        let mut m = masker();
        m.mask("张三");
        m.reset();
        assert!(m.table().is_empty());
        let masked = m.mask("李四");
        assert!(masked.contains("ENTITY_001"));
    }

    #[test]
    fn test_oov_surname_word_masked() {
        // 词典外的人名段即使没有 nr 标注也要命中
        let mut m = masker();
        let masked = m.mask("把结果发给张三丰");
        assert!(masked.contains("ENTITY_001"));
        assert!(!masked.contains("张三丰"));
    }

    #[test]
    fn test_dictionary_noun_with_surname_lead_not_masked() {
        // 金额以姓氏字开头，但是词典内名词，不按实体处理
        let mut m = masker();
        assert_eq!(m.mask("核对金额"), "核对金额");
    }

    #[test]
    fn test_disabled_masker_is_passthrough() {
        let mut m = Masker::disabled();
        assert_eq!(m.mask("张三"), "张三");
        assert!(m.table().is_empty());
    }

    #[test]
    fn test_mask_context_preserve_keys() {
        let mut m = Masker::new(Vec::new(), vec!["note".to_string(), "columns".to_string()]);
        let data = serde_json::json!({
            "note": "张三的备注",
            "columns": ["姓名", "金额"],
            "rows": [{"姓名": "张三"}]
        });
        let masked = m.mask_context(&data);
        assert_eq!(masked["note"], "张三的备注");
        assert_eq!(masked["columns"][0], "姓名");
        assert_eq!(masked["rows"][0]["姓名"], "ENTITY_001");
    }
}
