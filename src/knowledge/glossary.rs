//! Glossary Matcher - 정적 지표 용어 사전
//!
//! 대시보드 지표 정의를 키워드로 찾아 기본 검색 결과의 최우선 항목으로 씁니다.

/// 용어 사전 항목
#[derive(Debug, Clone, Copy)]
pub struct GlossaryEntry {
    pub title: &'static str,
    pub content: &'static str,
    pub keywords: &'static [&'static str],
}

/// 지표 용어 사전
pub const GLOSSARY: &[GlossaryEntry] = &[
    GlossaryEntry {
        title: "매출 성장률",
        content: "전월 대비 당월 매출이 얼마나 변했는지를 백분율(%)로 나타낸 값입니다.",
        keywords: &["매출", "성장률", "growth"],
    },
    GlossaryEntry {
        title: "재구매율",
        content: "두 번 이상 구매한 고객이 전체 고객에서 차지하는 비율입니다.",
        keywords: &["재구매", "충성도", "repeat"],
    },
    GlossaryEntry {
        title: "LTV/CAC",
        content: "고객 생애 가치(LTV)를 고객 획득 비용(CAC)으로 나눈 비율입니다. 3:1 이상이면 건전한 편입니다.",
        keywords: &["LTV", "CAC"],
    },
    GlossaryEntry {
        title: "이상 탐지",
        content: "Isolation Forest로 평소와 다른 매출 패턴을 찾아냅니다. 점수는 모델의 결정 함수 값을 기준으로 합니다.",
        keywords: &["이상", "anomaly"],
    },
    GlossaryEntry {
        title: "성장 유형",
        content: "가맹점을 급성장, 안정, 정체, 하락 네 가지로 분류합니다. 신뢰도는 예측 확률을 기준으로 합니다.",
        keywords: &["성장", "분류"],
    },
];

/// 용어 사전 검색 결과
#[derive(Debug, Clone, PartialEq)]
pub struct GlossaryHit {
    pub title: String,
    pub content: String,
    pub score: f32,
}

/// 쿼리에 포함된 키워드/제목으로 용어 점수화
///
/// 키워드 하나당 +2, 제목이 쿼리에 포함되면 +3. 점수 0인 항목은 제외합니다.
pub fn match_glossary(query: &str, top_k: usize) -> Vec<GlossaryHit> {
    match_entries(GLOSSARY, query, top_k)
}

fn match_entries(entries: &[GlossaryEntry], query: &str, top_k: usize) -> Vec<GlossaryHit> {
    let query = query.to_lowercase();

    let mut scored: Vec<(u32, &GlossaryEntry)> = entries
        .iter()
        .map(|entry| {
            let mut score = entry
                .keywords
                .iter()
                .map(|kw| kw.trim().to_lowercase())
                .filter(|kw| !kw.is_empty() && query.contains(kw.as_str()))
                .count() as u32
                * 2;

            let title = entry.title.trim().to_lowercase();
            if !title.is_empty() && query.contains(title.as_str()) {
                score += 3;
            }
            (score, entry)
        })
        .collect();

    scored.sort_by(|a, b| b.0.cmp(&a.0));

    scored
        .into_iter()
        .take(top_k)
        .filter(|(score, _)| *score > 0)
        .map(|(score, entry)| GlossaryHit {
            title: entry.title.to_string(),
            content: entry.content.to_string(),
            score: score as f32,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_title_and_keyword_scores() {
        let hits = match_glossary("재구매율 알려줘", 3);
        assert_eq!(hits[0].title, "재구매율");
        // 키워드 "재구매" +2, 제목 +3
        assert_eq!(hits[0].score, 5.0);
    }

    #[test]
    fn test_case_insensitive_keywords() {
        let hits = match_glossary("what is ltv/cac?", 3);
        assert_eq!(hits[0].title, "LTV/CAC");
        assert_eq!(hits[0].score, 7.0);
    }

    #[test]
    fn test_no_match() {
        assert!(match_glossary("weather today", 3).is_empty());
    }

    #[test]
    fn test_top_k_limit() {
        // "매출 성장률"과 "성장 유형" 모두 "성장" 관련
        let hits = match_glossary("매출 성장률과 성장 유형", 1);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "매출 성장률");
    }
}
