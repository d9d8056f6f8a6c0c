use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 流水线中已知的 agent 种类
///
/// 队列本身只把 `agent_type` 当作字符串过滤条件，这个枚举只在执行端使用：
/// 执行器注册表以它为键，Worker 按它分发领取到的任务。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AgentKind {
    /// 自然语言问题转换为检索查询
    QueryGeneration,
    /// 文档相关性打分
    RelevanceScoring,
    /// 引用抽取
    CitationExtraction,
    /// 报告综合
    ReportSynthesis,
    Other(String),
}

impl AgentKind {
    pub fn as_str(&self) -> &str {
        match self {
            AgentKind::QueryGeneration => "query_generation",
            AgentKind::RelevanceScoring => "relevance_scoring",
            AgentKind::CitationExtraction => "citation_extraction",
            AgentKind::ReportSynthesis => "report_synthesis",
            AgentKind::Other(name) => name,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, AgentKind::Other(_))
    }
}

impl From<&str> for AgentKind {
    fn from(value: &str) -> Self {
        match value {
            "query_generation" => AgentKind::QueryGeneration,
            "relevance_scoring" => AgentKind::RelevanceScoring,
            "citation_extraction" => AgentKind::CitationExtraction,
            "report_synthesis" => AgentKind::ReportSynthesis,
            other => AgentKind::Other(other.to_string()),
        }
    }
}

impl From<String> for AgentKind {
    fn from(value: String) -> Self {
        AgentKind::from(value.as_str())
    }
}

impl From<AgentKind> for String {
    fn from(kind: AgentKind) -> Self {
        kind.as_str().to_string()
    }
}

impl FromStr for AgentKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(AgentKind::from(s))
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
