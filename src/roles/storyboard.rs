//! 视频分镜：固定结构 `{slides: [{title, bullets, imagePrompt, voiceover}]}`
//!
//! 模型输出可能包在 ```json 代码块里或前后带说明文字，解析时先剥离，再严格校验每个字段。

use serde::{Deserialize, Serialize};

/// 单张幻灯片
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slide {
    pub title: String,
    pub bullets: Vec<String>,
    pub image_prompt: String,
    pub voiceover: String,
}

/// 有序幻灯片列表，交给视频渲染协作者
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Storyboard {
    pub slides: Vec<Slide>,
}

impl Storyboard {
    /// 所有旁白按顺序拼接，作为 TTS 的输入
    pub fn transcript(&self) -> String {
        self.slides
            .iter()
            .map(|s| s.voiceover.trim())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{\"slides\":[]}".to_string())
    }
}

/// 去掉代码块围栏与 JSON 对象外的文字
fn extract_json_object(raw: &str) -> &str {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```") {
        // 跳过语言标记（```json）
        text = rest.split_once('\n').map(|(_, body)| body).unwrap_or(rest);
        text = text.trim_end();
        text = text.strip_suffix("```").unwrap_or(text).trim();
    }
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => text,
    }
}

/// 解析并校验分镜；错误信息描述具体问题，供纠正提示使用
pub fn parse_storyboard(raw: &str) -> Result<Storyboard, String> {
    let json = extract_json_object(raw);
    let storyboard: Storyboard =
        serde_json::from_str(json).map_err(|e| format!("not a storyboard JSON object: {e}"))?;

    if storyboard.slides.is_empty() {
        return Err("\"slides\" must contain at least one slide".to_string());
    }
    for (i, slide) in storyboard.slides.iter().enumerate() {
        let n = i + 1;
        if slide.title.trim().is_empty() {
            return Err(format!("slide {n} has an empty title"));
        }
        if slide.bullets.is_empty() || slide.bullets.iter().any(|b| b.trim().is_empty()) {
            return Err(format!("slide {n} needs at least one non-empty bullet"));
        }
        if slide.image_prompt.trim().is_empty() {
            return Err(format!("slide {n} has an empty imagePrompt"));
        }
        if slide.voiceover.trim().is_empty() {
            return Err(format!("slide {n} has an empty voiceover"));
        }
    }
    Ok(storyboard)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slide_json(i: usize) -> String {
        format!(
            r#"{{"title": "Slide {i}", "bullets": ["a{i}", "b{i}"], "imagePrompt": "diagram {i}", "voiceover": "Narration {i}."}}"#
        )
    }

    fn storyboard_json(n: usize) -> String {
        let slides: Vec<String> = (1..=n).map(slide_json).collect();
        format!(r#"{{"slides": [{}]}}"#, slides.join(", "))
    }

    #[test]
    fn test_eight_slides_parse_with_all_fields() {
        let sb = parse_storyboard(&storyboard_json(8)).unwrap();
        assert_eq!(sb.slides.len(), 8);
        for (i, s) in sb.slides.iter().enumerate() {
            assert_eq!(s.title, format!("Slide {}", i + 1));
            assert_eq!(s.bullets.len(), 2);
            assert!(!s.image_prompt.is_empty());
            assert!(!s.voiceover.is_empty());
        }
    }

    #[test]
    fn test_fenced_and_chatty_output_is_accepted() {
        let fenced = format!("```json\n{}\n```", storyboard_json(2));
        assert_eq!(parse_storyboard(&fenced).unwrap().slides.len(), 2);

        let chatty = format!("Here is your storyboard:\n{}\nEnjoy!", storyboard_json(1));
        assert_eq!(parse_storyboard(&chatty).unwrap().slides.len(), 1);
    }

    #[test]
    fn test_shape_violations_are_rejected() {
        assert!(parse_storyboard("no json here").is_err());
        assert!(parse_storyboard(r#"{"slides": []}"#).is_err());
        let missing_prompt = r#"{"slides": [{"title": "t", "bullets": ["b"], "voiceover": "v"}]}"#;
        assert!(parse_storyboard(missing_prompt).unwrap_err().contains("imagePrompt"));
        let empty_bullets =
            r#"{"slides": [{"title": "t", "bullets": [], "imagePrompt": "p", "voiceover": "v"}]}"#;
        assert!(parse_storyboard(empty_bullets).unwrap_err().contains("bullet"));
    }

    #[test]
    fn test_serializes_camel_case_and_transcript() {
        let sb = parse_storyboard(&storyboard_json(2)).unwrap();
        let json = serde_json::to_value(&sb).unwrap();
        assert!(json["slides"][0]["imagePrompt"].is_string());
        assert_eq!(sb.transcript(), "Narration 1.\n\nNarration 2.");
    }
}
