//! 阶段提示词组装
//!
//! 课程信息 + 上游文档（原文）+ 可选的编辑指令。编辑指令只作为追加指示，不替换课程描述，也不做语义 diff。

use crate::core::GenerationError;
use crate::stage::{CourseInfo, StageContext, StageId};

const FOUNDATION_SYSTEM: &str = "你是一位资深的课程设计专家，精通 UbD（为理解而设计）逆向设计与 PBL 项目式学习。
你的任务是完成 UbD 阶段一：确定预期学习结果。
请围绕 G/U/Q/K/S 组织内容：
- G 迁移目标
- U 持续理解（抽象的 big ideas，并说明理由）
- Q 基本问题（开放性问题）
- K 需要知道的知识
- S 能够做到的技能
使用 Markdown 输出，标题层级清晰，不要输出 JSON。";

const EVIDENCE_SYSTEM: &str = "你是一位资深的教育评估专家。
你的任务是基于已确定的预期学习结果，完成 UbD 阶段二：确定可接受的证据。
内容包括：驱动性问题、表现性任务（含里程碑）、评估量规以及其他证据。
评估要兼顾过程与成果，量规使用 Markdown 表格。使用 Markdown 输出，不要输出 JSON。";

const BLUEPRINT_SYSTEM: &str = "你是一位资深的 PBL 课程设计师。
你的任务是基于阶段一的预期学习结果和阶段二的评估证据，完成 UbD 阶段三：规划学习体验。
按 PBL 的项目启动、知识建构、探究实践、成果展示四个阶段组织学习活动，说明每个活动的目标、时长、
对应的评估证据与所需材料，并遵循 WHERETO 原则。使用 Markdown 输出，不要输出 JSON。";

/// 各阶段的系统提示词
pub fn system_prompt(stage: StageId) -> &'static str {
    match stage {
        StageId::Foundation => FOUNDATION_SYSTEM,
        StageId::Evidence => EVIDENCE_SYSTEM,
        StageId::Blueprint => BLUEPRINT_SYSTEM,
    }
}

fn or_unspecified(value: &Option<String>) -> &str {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("未指定")
}

fn course_block(course: &CourseInfo) -> String {
    format!(
        "# 课程信息\n- 课程名称：{}\n- 学科领域：{}\n- 年级水平：{}\n- 课程时长：{}\n- 课程简介：{}\n",
        course.title.trim(),
        or_unspecified(&course.subject),
        or_unspecified(&course.grade_level),
        or_unspecified(&course.duration),
        or_unspecified(&course.description),
    )
}

/// 组装某阶段的 user prompt；缺少上游文档时返回 MissingUpstream
pub fn build_user_prompt(stage: StageId, ctx: &StageContext) -> Result<String, GenerationError> {
    let mut out = course_block(&ctx.course);

    for prerequisite in stage.prerequisites() {
        let doc = ctx
            .upstream
            .get(prerequisite)
            .ok_or(GenerationError::MissingUpstream(*prerequisite))?;
        out.push_str(&format!(
            "\n# 已确认的{}\n\n{}\n",
            prerequisite.title(),
            doc.content
        ));
    }

    out.push_str(&format!("\n请基于以上信息生成{}的完整内容。\n", stage.title()));

    if let Some(edit) = &ctx.edit {
        if let Some(current) = edit
            .current_document
            .as_deref()
            .filter(|d| !d.trim().is_empty())
        {
            out.push_str(&format!("\n# 当前版本\n\n{}\n", current));
        }
        out.push_str("\n# 修改要求\n\n请在保持其余内容不变的前提下，应用以下修改：\n");
        out.push_str(edit.instructions.trim());
        out.push('\n');
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{EditDirective, StageDocument};

    fn course() -> CourseInfo {
        CourseInfo {
            title: "AI 与社区".into(),
            subject: Some("信息技术".into()),
            description: Some("用 AI 解决社区问题".into()),
            ..CourseInfo::default()
        }
    }

    #[test]
    fn test_upstream_documents_are_included_verbatim() {
        let doc1 = "## G\n- 目标 {not json}";
        let doc2 = "| 维度 | 标准 |\n|---|---|";
        let ctx = StageContext::new(course())
            .with_upstream(StageDocument::new(StageId::Foundation, doc1))
            .with_upstream(StageDocument::new(StageId::Evidence, doc2));

        let prompt = build_user_prompt(StageId::Blueprint, &ctx).unwrap();
        assert!(prompt.contains(doc1));
        assert!(prompt.contains(doc2));
        assert!(prompt.find(doc1).unwrap() < prompt.find(doc2).unwrap());
        assert!(prompt.contains("年级水平：未指定"));
    }

    #[test]
    fn test_missing_upstream_is_reported() {
        let ctx = StageContext::new(course());
        let err = build_user_prompt(StageId::Evidence, &ctx).unwrap_err();
        assert_eq!(err, GenerationError::MissingUpstream(StageId::Foundation));
    }

    #[test]
    fn test_edit_instructions_are_appended_not_replacing_description() {
        let ctx = StageContext::new(course()).with_edit(EditDirective {
            instructions: "增加一个关于数据隐私的持续理解".into(),
            current_document: Some("## U\n- 旧理解".into()),
        });
        let prompt = build_user_prompt(StageId::Foundation, &ctx).unwrap();

        let description_at = prompt.find("用 AI 解决社区问题").unwrap();
        let edit_at = prompt.find("增加一个关于数据隐私的持续理解").unwrap();
        assert!(description_at < edit_at);
        assert!(prompt.contains("## U\n- 旧理解"));
        assert!(prompt.contains("保持其余内容不变"));
    }
}
