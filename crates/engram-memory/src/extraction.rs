//! Rule-driven entity extraction.
//!
//! Rules are data: an ordered pattern list, a keyword list and a minimum
//! confidence per entity type, iterated uniformly. Pattern matches earn a
//! fixed confidence bonus; keyword matches fall back to the first
//! keyword-bearing sentence at the rule's base confidence.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use engram_core::current_unix_timestamp_ms;
use engram_store::EntityType;

use crate::ids::short_id;

/// Candidates at or above this confidence are promoted without confirmation.
pub const AUTO_CONFIRM_THRESHOLD: f32 = 0.85;

const PATTERN_CONFIDENCE_BONUS: f32 = 0.2;
const MAX_EXTRACTED_CHARS: usize = 200;
const MAX_SNIPPET_CHARS: usize = 300;
// Sentence boundaries for keyword extraction. ASCII '.' is deliberately not
// one of them: file-extension keywords like ".ts" need their sentence intact.
const SENTENCE_BOUNDARIES: [char; 6] = ['。', '！', '？', '!', '?', '\n'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMethod {
    Pattern,
    Keyword,
}

/// One detection rule; patterns are applied in order.
pub struct DetectionRule {
    pub entity_type: EntityType,
    pub patterns: &'static [&'static str],
    pub keywords: &'static [&'static str],
    pub min_confidence: f32,
}

pub const DETECTION_RULES: &[DetectionRule] = &[
    DetectionRule {
        entity_type: EntityType::Decision,
        patterns: &[
            r"(?:我|我们)?(?:决定|确定|选择|采用|使用)(?:了)?(.{5,50}?)(?:方案|方式|方法|来|作为|进行)?",
            r"(?:最终|最后)?(?:选择|采用|决定)(?:了)?(.{5,50})",
            r"(.{5,30}?)(?:是|作为)(?:最佳|最好|更好的)?(?:选择|方案)",
        ],
        keywords: &["决定", "采用", "选择", "确定使用", "决策", "敲定"],
        min_confidence: 0.7,
    },
    DetectionRule {
        entity_type: EntityType::Architecture,
        patterns: &[
            r"(?:采用|使用|基于)(.{5,50}?)(?:架构|设计|模式|结构)",
            r"(?:架构|设计|结构)(?:是|为|采用)(.{5,50})",
            r"(.{5,30}?)(?:分层|模块化|微服务|单体)",
        ],
        keywords: &["架构", "设计模式", "分层", "模块", "组件结构"],
        min_confidence: 0.7,
    },
    DetectionRule {
        entity_type: EntityType::Preference,
        patterns: &[
            r"(?:我|用户)?(?:喜欢|偏好|倾向于|更愿意)(.{5,50})",
            r"(?:prefer|偏好)(?:使用|用)?(.{5,50})",
        ],
        keywords: &["喜欢", "偏好", "倾向于", "prefer", "更喜欢"],
        min_confidence: 0.6,
    },
    DetectionRule {
        entity_type: EntityType::Concept,
        patterns: &[
            r"(.{2,20}?)(?:是指|是什么|的意思是|定义为)(.{10,100})",
            r"(?:什么是|解释一下)(.{2,20})",
            r"我是(.{2,20}?)(?:，|,|。|$)",
            r"我叫(.{2,10})",
            r"我的名字是(.{2,10})",
            r"(?:我|用户)是(.{2,30}?)(?:的|，|,|。|$)",
        ],
        keywords: &["是什么", "什么是", "意思是", "定义", "概念", "解释", "我是", "我叫"],
        min_confidence: 0.5,
    },
    DetectionRule {
        entity_type: EntityType::Habit,
        patterns: &[r"(?:我|用户)?(?:习惯|总是|一般会|通常|每次都)(.{5,50})"],
        keywords: &["习惯", "总是", "一般会", "通常", "每次都"],
        min_confidence: 0.6,
    },
    DetectionRule {
        entity_type: EntityType::File,
        patterns: &[
            r"(.{5,50}\.(?:rs|ts|js|vue|py|java|go))(?:文件)?(?:负责|处理|实现|包含)(.{5,50})",
            r"(?:在|修改|创建|查看)(.{5,50}\.(?:rs|ts|js|vue|py|java|go))",
        ],
        keywords: &[".rs", ".ts", ".js", ".vue", ".py", "文件负责", "文件处理"],
        min_confidence: 0.8,
    },
];

/// An unconfirmed extraction awaiting promotion or rejection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityCandidate {
    pub id: String,
    pub entity_type: EntityType,
    pub extracted_content: String,
    pub source_snippet: String,
    pub confidence: f32,
    pub detected_at: u64,
    pub detection_method: DetectionMethod,
}

fn compiled_rules() -> &'static [(usize, Vec<Regex>)] {
    static COMPILED: OnceLock<Vec<(usize, Vec<Regex>)>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        DETECTION_RULES
            .iter()
            .enumerate()
            .map(|(index, rule)| {
                let patterns = rule
                    .patterns
                    .iter()
                    .filter_map(|pattern| Regex::new(&format!("(?i){pattern}")).ok())
                    .collect();
                (index, patterns)
            })
            .collect()
    })
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Runs every detection rule over `content` and returns the candidates of
/// this pass. Duplicate extracted strings are suppressed across rules.
pub fn detect_candidates(content: &str) -> Vec<EntityCandidate> {
    let detected_at = current_unix_timestamp_ms();
    let snippet = truncate_chars(content, MAX_SNIPPET_CHARS);
    let mut seen: HashSet<String> = HashSet::new();
    let mut candidates = Vec::new();

    for (rule_index, patterns) in compiled_rules() {
        let rule = &DETECTION_RULES[*rule_index];
        let mut pattern_matched = false;

        for pattern in patterns {
            for captures in pattern.captures_iter(content) {
                let extracted = captures
                    .iter()
                    .skip(1)
                    .flatten()
                    .map(|group| group.as_str().trim())
                    .filter(|group| !group.is_empty())
                    .collect::<Vec<_>>()
                    .join(" ");
                let extracted = extracted.trim().to_string();
                if extracted.chars().count() <= 3 || seen.contains(&extracted) {
                    continue;
                }
                seen.insert(extracted.clone());
                pattern_matched = true;
                candidates.push(EntityCandidate {
                    id: short_id("cand"),
                    entity_type: rule.entity_type,
                    extracted_content: truncate_chars(&extracted, MAX_EXTRACTED_CHARS),
                    source_snippet: snippet.clone(),
                    confidence: rule.min_confidence + PATTERN_CONFIDENCE_BONUS,
                    detected_at,
                    detection_method: DetectionMethod::Pattern,
                });
            }
        }

        if pattern_matched || !rule.keywords.iter().any(|keyword| content.contains(keyword)) {
            continue;
        }
        // No pattern hit for this type; take the first keyword-bearing
        // sentence as a single lower-confidence candidate.
        for sentence in content.split(|c: char| SENTENCE_BOUNDARIES.contains(&c)) {
            let sentence = sentence.trim();
            if sentence.chars().count() <= 5
                || !rule.keywords.iter().any(|keyword| sentence.contains(keyword))
                || seen.contains(sentence)
            {
                continue;
            }
            seen.insert(sentence.to_string());
            candidates.push(EntityCandidate {
                id: short_id("cand"),
                entity_type: rule.entity_type,
                extracted_content: truncate_chars(sentence, MAX_EXTRACTED_CHARS),
                source_snippet: snippet.clone(),
                confidence: rule.min_confidence,
                detected_at,
                detection_method: DetectionMethod::Keyword,
            });
            break;
        }
    }

    candidates
}
