//! 路由表：按 (exchange, routing key) 解析出唯一的 RouteRule。
//!
//! 多条规则同时匹配时，按配置声明顺序取第一条。

use domain::{ExchangeKind, RouteRule};

/// 路由表构建错误。
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("no routes configured")]
    Empty,
    #[error("invalid routing pattern for {route}: {reason}")]
    InvalidPattern { route: String, reason: String },
}

/// 静态路由表（启动时构建，之后只读）。
#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: Vec<RouteRule>,
}

impl RouteTable {
    pub fn new(routes: Vec<RouteRule>) -> Result<Self, RouteError> {
        if routes.is_empty() {
            return Err(RouteError::Empty);
        }
        for rule in &routes {
            if rule.exchange_kind == ExchangeKind::Topic {
                validate_topic_pattern(&rule.routing_pattern).map_err(|reason| {
                    RouteError::InvalidPattern {
                        route: rule.label(),
                        reason,
                    }
                })?;
            }
        }
        Ok(Self { routes })
    }

    /// 查找第一条匹配的路由。
    pub fn resolve(&self, exchange: &str, routing_key: &str) -> Option<&RouteRule> {
        self.routes
            .iter()
            .find(|rule| rule_matches(rule, exchange, routing_key))
    }

    /// 按投递所属的订阅查找路由。
    ///
    /// 订阅规则接收该 key 时直接使用它（重叠订阅各自按自己的规则处理）；
    /// 否则（例如已存在的队列还有其他绑定）退回按表查找。
    pub fn resolve_for<'a>(
        &'a self,
        subscription: &'a RouteRule,
        exchange: &str,
        routing_key: &str,
    ) -> Option<&'a RouteRule> {
        if rule_matches(subscription, exchange, routing_key) {
            return Some(subscription);
        }
        self.resolve(exchange, routing_key)
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// 单条规则是否接收该 (exchange, routing key) 的消息。
pub fn rule_matches(rule: &RouteRule, exchange: &str, routing_key: &str) -> bool {
    if rule.exchange != exchange {
        return false;
    }
    // 默认 exchange 按队列名投递
    if rule.exchange.is_empty() {
        if rule.queue_name.as_deref() == Some(routing_key) {
            return true;
        }
        return topic_matches(&rule.routing_pattern, routing_key);
    }
    match rule.exchange_kind {
        ExchangeKind::Topic => topic_matches(&rule.routing_pattern, routing_key),
        ExchangeKind::Direct => rule.routing_pattern == routing_key,
        ExchangeKind::Fanout | ExchangeKind::Headers => true,
    }
}

/// AMQP topic 匹配：`*` 匹配恰好一个单词，`#` 匹配零个或多个单词。
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    match_words(&pattern, &key)
}

/// 自后向前的动态规划，耗时与 模式词数 × key 词数 成正比。
fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    // next[j]：剩余模式能否匹配 key[j..]
    let mut next = vec![false; key.len() + 1];
    next[key.len()] = true;
    for word in pattern.iter().rev() {
        let mut current = vec![false; key.len() + 1];
        for j in (0..=key.len()).rev() {
            let has_word = j < key.len();
            current[j] = match *word {
                "#" => next[j] || (has_word && current[j + 1]),
                "*" => has_word && next[j + 1],
                literal => has_word && key[j] == literal && next[j + 1],
            };
        }
        next = current;
    }
    next[0]
}

fn validate_topic_pattern(pattern: &str) -> Result<(), String> {
    if pattern.is_empty() {
        return Err("empty pattern".to_string());
    }
    for word in pattern.split('.') {
        if word.is_empty() {
            return Err("empty word".to_string());
        }
        if word.len() > 1 && (word.contains('#') || word.contains('*')) {
            return Err(format!("wildcard must be a whole word: {}", word));
        }
    }
    Ok(())
}
