//! Current date and time

use chrono::{Datelike, Local, NaiveDateTime, Weekday};

use super::Tool;
use crate::Result;

/// Reports the local date, time and weekday
#[derive(Debug, Default)]
pub struct CurrentTimeTool;

impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "get_current_time"
    }

    fn description(&self) -> &str {
        "Get the current local date, time and day of the week"
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }

    fn call(&self, _arguments: &serde_json::Value) -> Result<String> {
        Ok(describe_time(Local::now().naive_local()))
    }
}

/// Format a timestamp the way the assistant reads it out
#[must_use]
pub fn describe_time(at: NaiveDateTime) -> String {
    format!(
        "现在是{} {}",
        at.format("%Y年%m月%d日 %H:%M:%S"),
        weekday_name(at.weekday())
    )
}

const fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "星期一",
        Weekday::Tue => "星期二",
        Weekday::Wed => "星期三",
        Weekday::Thu => "星期四",
        Weekday::Fri => "星期五",
        Weekday::Sat => "星期六",
        Weekday::Sun => "星期日",
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    #[test]
    fn test_describe_time() {
        let at = NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(14, 3, 22)
            .unwrap();
        assert_eq!(describe_time(at), "现在是2024年05月01日 14:03:22 星期三");
    }

    #[test]
    fn test_tool_reports_weekday() {
        let text = CurrentTimeTool.call(&serde_json::json!({})).unwrap();
        assert!(text.starts_with("现在是"));
        assert!(text.contains("星期"));
    }
}
