// 内置工具定义与执行入口。工具失败一律转成文本结果返回给模型，不向上抛错。
use crate::calc;
use crate::config::Config;
use crate::credentials::resolve_tool_key;
use crate::schemas::ToolSpec;
use crate::storage::StorageBackend;
use crate::usage::UsageLedger;
use chrono::Utc;
use chrono_tz::Tz;
use futures::future::join_all;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

const TAVILY_ENDPOINT: &str = "https://api.tavily.com/search";
const OPENWEATHER_GEO: &str = "https://api.openweathermap.org/geo/1.0/direct";
const OPENWEATHER_CURRENT: &str = "https://api.openweathermap.org/data/2.5/weather";

/// deep_search 总查询数上限：主查询 + 前 3 条相关查询。
const DEEP_SEARCH_MAX_QUERIES: usize = 4;

pub struct ToolContext<'a> {
    pub user_id: &'a str,
    pub config: &'a Config,
    pub storage: &'a Arc<dyn StorageBackend>,
    pub usage: &'a UsageLedger,
    pub http: &'a reqwest::Client,
}

pub const ALL_TOOL_NAMES: [&str; 5] = [
    "web_search",
    "deep_search",
    "weather",
    "datetime",
    "calculator",
];

pub fn builtin_tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "web_search".to_string(),
            description: "Search the web for current information. Returns top results with short summaries.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "The search query"}
                },
                "required": ["query"]
            }),
        },
        ToolSpec {
            name: "deep_search".to_string(),
            description: "Run an in-depth web search: the main query plus up to three related queries, searched concurrently with more results each.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "The primary search query"},
                    "related_queries": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "Optional related queries to broaden the search"
                    }
                },
                "required": ["query"]
            }),
        },
        ToolSpec {
            name: "weather".to_string(),
            description: "Get the current weather for a location.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "location": {"type": "string", "description": "City name, optionally with country code"},
                    "units": {"type": "string", "enum": ["metric", "imperial"], "description": "Unit system, defaults to metric"}
                },
                "required": ["location"]
            }),
        },
        ToolSpec {
            name: "datetime".to_string(),
            description: "Get the current date and/or time, optionally in a specific IANA timezone.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "format": {"type": "string", "enum": ["full", "date", "time"], "description": "What to return, defaults to full"},
                    "timezone": {"type": "string", "description": "IANA timezone name such as Asia/Shanghai"}
                }
            }),
        },
        ToolSpec {
            name: "calculator".to_string(),
            description: "Evaluate an arithmetic expression with + - * / and parentheses.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "expression": {"type": "string", "description": "The expression to evaluate"}
                },
                "required": ["expression"]
            }),
        },
    ]
}

/// 只保留用户启用的工具。
pub fn tool_specs(enabled: &[String]) -> Vec<ToolSpec> {
    builtin_tool_specs()
        .into_iter()
        .filter(|spec| enabled.iter().any(|name| name == &spec.name))
        .collect()
}

pub async fn execute_tool(context: &ToolContext<'_>, name: &str, arguments: &Value) -> String {
    match name {
        "web_search" => web_search(context, arguments).await,
        "deep_search" => deep_search(context, arguments).await,
        "weather" => weather(context, arguments).await,
        "datetime" => datetime(arguments),
        "calculator" => calculator(arguments),
        other => format!("Unknown tool: {other}"),
    }
}

fn string_arg<'a>(arguments: &'a Value, key: &str) -> Option<&'a str> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

async fn web_search(context: &ToolContext<'_>, arguments: &Value) -> String {
    let Some(query) = string_arg(arguments, "query") else {
        return "Search failed: missing query".to_string();
    };
    let Ok(key) = resolve_tool_key(
        context.storage,
        context.config,
        context.user_id,
        "tavily",
        "TAVILY_API_KEY",
    ) else {
        return "Search failed: credential lookup error".to_string();
    };
    let Some((api_key, user_key)) = key else {
        return simulated_search(query);
    };
    if !user_key {
        // 内置密钥按配额计数，达到上限时直接短路。
        match context.usage.increment_searches(context.user_id) {
            Ok(()) => {}
            Err(_) => {
                return "Search limit reached for this month. Add your own Tavily API key in settings to keep searching.".to_string();
            }
        }
    }
    match tavily_search(context.http, &api_key, query, "basic", 5).await {
        Ok(results) => results,
        Err(err) => {
            warn!("web search failed: {err}");
            format!("Search failed: {err}")
        }
    }
}

/// 收集 deep_search 的查询列表：主查询 + 前 3 条相关查询。
/// 只截取前 3 条，再去空去重；空槽不会被后面的条目顶替。
pub fn collect_deep_search_queries(query: &str, related: &[String]) -> Vec<String> {
    let mut queries = vec![query.trim().to_string()];
    for related_query in related.iter().take(DEEP_SEARCH_MAX_QUERIES - 1) {
        let trimmed = related_query.trim();
        if trimmed.is_empty() || queries.iter().any(|existing| existing == trimmed) {
            continue;
        }
        queries.push(trimmed.to_string());
    }
    queries
}

async fn deep_search(context: &ToolContext<'_>, arguments: &Value) -> String {
    let Some(query) = string_arg(arguments, "query") else {
        return "Search failed: missing query".to_string();
    };
    let related: Vec<String> = arguments
        .get("related_queries")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let Ok(key) = resolve_tool_key(
        context.storage,
        context.config,
        context.user_id,
        "tavily",
        "TAVILY_API_KEY",
    ) else {
        return "Search failed: credential lookup error".to_string();
    };
    let Some((api_key, user_key)) = key else {
        return simulated_search(query);
    };
    if !user_key {
        // 深搜按 3 倍消息计价：生成本身计 1 次，这里再补 2 次；不占搜索额度。
        let _ = context.usage.increment_messages(context.user_id, 2);
    }

    let queries = collect_deep_search_queries(query, &related);
    let futures = queries
        .iter()
        .map(|item| tavily_search(context.http, &api_key, item, "advanced", 8));
    let results = join_all(futures).await;

    let mut output = String::new();
    for (item, result) in queries.iter().zip(results) {
        if !output.is_empty() {
            output.push_str("\n\n");
        }
        output.push_str(&format!("=== Results for \"{item}\" ===\n"));
        match result {
            Ok(text) => output.push_str(&text),
            Err(err) => {
                warn!("deep search query failed: {item}, {err}");
                output.push_str(&format!("Search failed: {err}"));
            }
        }
    }
    output
}

async fn tavily_search(
    http: &reqwest::Client,
    api_key: &str,
    query: &str,
    depth: &str,
    max_results: u32,
) -> Result<String, String> {
    let response = http
        .post(TAVILY_ENDPOINT)
        .json(&json!({
            "api_key": api_key,
            "query": query,
            "search_depth": depth,
            "max_results": max_results,
            "include_answer": true,
            // 深搜取原文，普通搜索只要摘要。
            "include_raw_content": depth == "advanced",
        }))
        .send()
        .await
        .map_err(|err| err.to_string())?;
    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);
    if !status.is_success() {
        return Err(format!("search service returned {status}"));
    }
    let mut output = String::new();
    if let Some(answer) = body.get("answer").and_then(Value::as_str) {
        if !answer.trim().is_empty() {
            output.push_str("Summary: ");
            output.push_str(answer.trim());
            output.push_str("\n\n");
        }
    }
    let results = body
        .get("results")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if results.is_empty() && output.is_empty() {
        return Ok(format!("No results found for \"{query}\"."));
    }
    for (index, result) in results.iter().enumerate() {
        let title = result.get("title").and_then(Value::as_str).unwrap_or("");
        let url = result.get("url").and_then(Value::as_str).unwrap_or("");
        let content = result.get("content").and_then(Value::as_str).unwrap_or("");
        output.push_str(&format!("{}. {title}\n{url}\n{content}\n", index + 1));
    }
    Ok(output.trim_end().to_string())
}

fn simulated_search(query: &str) -> String {
    format!(
        "Simulated search results for \"{query}\". Web search is not configured on this server; add a Tavily API key in settings to enable real results."
    )
}

async fn weather(context: &ToolContext<'_>, arguments: &Value) -> String {
    let Some(location) = string_arg(arguments, "location") else {
        return "Weather lookup failed: missing location".to_string();
    };
    let units = match string_arg(arguments, "units") {
        Some("imperial") => "imperial",
        _ => "metric",
    };
    let Ok(key) = resolve_tool_key(
        context.storage,
        context.config,
        context.user_id,
        "openweather",
        "OPENWEATHER_API_KEY",
    ) else {
        return "Weather lookup failed: credential lookup error".to_string();
    };
    let Some((api_key, _)) = key else {
        return format!(
            "Simulated weather for {location}: 22°C, partly cloudy. Weather data is not configured on this server; add an OpenWeather API key in settings for live data."
        );
    };
    match fetch_weather(context.http, &api_key, location, units).await {
        Ok(report) => report,
        Err(err) => {
            warn!("weather lookup failed: {location}, {err}");
            format!("Weather lookup failed: {err}")
        }
    }
}

async fn fetch_weather(
    http: &reqwest::Client,
    api_key: &str,
    location: &str,
    units: &str,
) -> Result<String, String> {
    // 先地理编码，再查当前天气。
    let geo: Value = http
        .get(OPENWEATHER_GEO)
        .query(&[("q", location), ("limit", "1"), ("appid", api_key)])
        .send()
        .await
        .map_err(|err| err.to_string())?
        .json()
        .await
        .map_err(|err| err.to_string())?;
    let place = geo
        .as_array()
        .and_then(|items| items.first())
        .ok_or_else(|| format!("location not found: {location}"))?;
    let lat = place
        .get("lat")
        .and_then(Value::as_f64)
        .ok_or_else(|| "geocoding response missing coordinates".to_string())?;
    let lon = place
        .get("lon")
        .and_then(Value::as_f64)
        .ok_or_else(|| "geocoding response missing coordinates".to_string())?;
    let name = place
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or(location);

    let current: Value = http
        .get(OPENWEATHER_CURRENT)
        .query(&[
            ("lat", lat.to_string()),
            ("lon", lon.to_string()),
            ("units", units.to_string()),
            ("appid", api_key.to_string()),
        ])
        .send()
        .await
        .map_err(|err| err.to_string())?
        .json()
        .await
        .map_err(|err| err.to_string())?;
    let temperature = current
        .get("main")
        .and_then(|main| main.get("temp"))
        .and_then(Value::as_f64)
        .ok_or_else(|| "weather response missing temperature".to_string())?;
    let feels_like = current
        .get("main")
        .and_then(|main| main.get("feels_like"))
        .and_then(Value::as_f64)
        .unwrap_or(temperature);
    let humidity = current
        .get("main")
        .and_then(|main| main.get("humidity"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let description = current
        .get("weather")
        .and_then(|weather| weather.get(0))
        .and_then(|entry| entry.get("description"))
        .and_then(Value::as_str)
        .unwrap_or("unknown conditions");
    let unit_symbol = if units == "imperial" { "°F" } else { "°C" };
    Ok(format!(
        "Weather in {name}: {temperature:.1}{unit_symbol} (feels like {feels_like:.1}{unit_symbol}), {description}, humidity {humidity}%."
    ))
}

fn datetime(arguments: &Value) -> String {
    let format = string_arg(arguments, "format").unwrap_or("full");
    let timezone = string_arg(arguments, "timezone");
    let (formatted_zone, now) = match timezone {
        Some(name) => match name.parse::<Tz>() {
            Ok(zone) => (
                name.to_string(),
                Utc::now().with_timezone(&zone).naive_local(),
            ),
            Err(_) => return format!("Unknown timezone: {name}"),
        },
        None => ("UTC".to_string(), Utc::now().naive_utc()),
    };
    match format {
        "date" => format!(
            "Current date: {} ({formatted_zone})",
            now.format("%Y-%m-%d")
        ),
        "time" => format!(
            "Current time: {} ({formatted_zone})",
            now.format("%H:%M:%S")
        ),
        _ => format!(
            "Current date and time: {} ({formatted_zone})",
            now.format("%Y-%m-%d %H:%M:%S")
        ),
    }
}

fn calculator(arguments: &Value) -> String {
    let Some(expression) = string_arg(arguments, "expression") else {
        return "Calculation failed: missing expression".to_string();
    };
    match calc::evaluate(expression) {
        Ok(value) => calc::format_result(value),
        Err(err) => format!("Calculation failed: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deep_search_caps_queries_at_four() {
        let related: Vec<String> = ["a", "b", "c", "d", "e"]
            .iter()
            .map(|item| item.to_string())
            .collect();
        let queries = collect_deep_search_queries("primary", &related);
        assert_eq!(queries, vec!["primary", "a", "b", "c"]);
    }

    #[test]
    fn deep_search_budget_only_covers_first_three_related() {
        // 第 4 条不会顶替被剔除的空白条目。
        let related: Vec<String> = ["", "a", "b", "c"]
            .iter()
            .map(|item| item.to_string())
            .collect();
        let queries = collect_deep_search_queries("primary", &related);
        assert_eq!(queries, vec!["primary", "a", "b"]);
    }

    #[test]
    fn deep_search_skips_blank_and_duplicate_queries() {
        let related = vec![
            "  ".to_string(),
            "primary".to_string(),
            "other".to_string(),
        ];
        let queries = collect_deep_search_queries("primary", &related);
        assert_eq!(queries, vec!["primary", "other"]);
    }

    #[test]
    fn tool_specs_filter_by_enabled_list() {
        let enabled = vec!["calculator".to_string(), "datetime".to_string()];
        let specs = tool_specs(&enabled);
        let names: Vec<&str> = specs.iter().map(|spec| spec.name.as_str()).collect();
        assert_eq!(names, vec!["datetime", "calculator"]);
        assert!(tool_specs(&[]).is_empty());
    }

    #[test]
    fn every_builtin_tool_is_listed() {
        let specs = builtin_tool_specs();
        assert_eq!(specs.len(), ALL_TOOL_NAMES.len());
        for name in ALL_TOOL_NAMES {
            assert!(specs.iter().any(|spec| spec.name == name));
        }
    }

    #[test]
    fn datetime_formats() {
        let date = datetime(&json!({ "format": "date" }));
        assert!(date.starts_with("Current date: "));
        assert!(date.ends_with("(UTC)"));

        let time = datetime(&json!({ "format": "time", "timezone": "Asia/Shanghai" }));
        assert!(time.starts_with("Current time: "));
        assert!(time.ends_with("(Asia/Shanghai)"));

        let unknown = datetime(&json!({ "timezone": "Mars/Olympus" }));
        assert_eq!(unknown, "Unknown timezone: Mars/Olympus");
    }

    #[test]
    fn calculator_reports_errors_as_text() {
        assert_eq!(
            calculator(&json!({ "expression": "2 + 2 * 3" })),
            "Result: 8"
        );
        assert!(calculator(&json!({ "expression": "1 / 0" })).starts_with("Calculation failed"));
        assert!(calculator(&json!({})).starts_with("Calculation failed"));
    }
}
