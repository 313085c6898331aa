//! Routing rules: priority-ordered overrides evaluated before load balancing
//!
//! Rules arrive already in effective order (priority descending, name
//! ascending; disabled rules filtered out). The first match wins. A rule
//! naming a concrete channel bypasses the balancer entirely; the `*` target
//! defers to it, optionally overriding the model first.

use crate::models::{RequestContext, RoutingRule, RuleCondition, ANY_CHANNEL};

/// Where a matching rule sends the request
#[derive(Debug, Clone, PartialEq)]
pub enum RouteTarget {
    /// A specific channel by name; balancer bypassed
    Named(String),
    /// Any channel via the load balancer
    Any,
}

/// Outcome of rule evaluation
#[derive(Debug, Clone)]
pub struct RouteDecision {
    /// Selected target
    pub target: RouteTarget,
    /// Model override to apply before selection and transforms
    pub model: Option<String>,
    /// Name of the rule that fired, for spans and logs
    pub rule: String,
}

/// Evaluate rules against the request context; first match wins
pub fn evaluate(rules: &[RoutingRule], ctx: &RequestContext) -> Option<RouteDecision> {
    for rule in rules {
        if !rule.enabled {
            continue;
        }
        if matches(&rule.condition, ctx) {
            let target = if rule.target_channel == ANY_CHANNEL {
                RouteTarget::Any
            } else {
                RouteTarget::Named(rule.target_channel.clone())
            };
            tracing::debug!(rule = %rule.name, ?target, "routing rule matched");
            return Some(RouteDecision {
                target,
                model: rule.target_model.clone(),
                rule: rule.name.clone(),
            });
        }
    }
    None
}

/// Evaluate one condition against the request context
pub fn matches(condition: &RuleCondition, ctx: &RequestContext) -> bool {
    match condition {
        RuleCondition::ModelEquals { model } => ctx.model == *model,
        RuleCondition::ModelPrefix { prefix } => ctx.model.starts_with(prefix.as_str()),
        RuleCondition::ModelContains { substring } => ctx.model.contains(substring.as_str()),
        RuleCondition::PathPrefix { prefix } => ctx.path.starts_with(prefix.as_str()),
        RuleCondition::HeaderEquals { name, value } => ctx
            .headers
            .get(&name.to_ascii_lowercase())
            .map(|v| v == value)
            .unwrap_or(false),
        RuleCondition::UserEquals { user } => ctx.user_id.as_deref() == Some(user.as_str()),
        RuleCondition::HasTag { tag } => ctx.tags.iter().any(|t| t == tag),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;

    fn rule(name: &str, priority: i64, condition: RuleCondition, target: &str) -> RoutingRule {
        let now = Utc::now();
        RoutingRule {
            id: format!("rule-{}", name),
            name: name.to_string(),
            condition,
            target_channel: target.to_string(),
            target_model: None,
            priority,
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    fn ctx(model: &str) -> RequestContext {
        RequestContext {
            model: model.to_string(),
            path: "/v1/messages".to_string(),
            method: "POST".to_string(),
            headers: HashMap::new(),
            user_id: None,
            tags: Vec::new(),
            stream: false,
            request_id: "req-1".to_string(),
        }
    }

    #[test]
    fn test_first_match_wins_in_given_order() {
        let rules = vec![
            rule(
                "opus-premium",
                100,
                RuleCondition::ModelEquals {
                    model: "claude-opus-4".to_string(),
                },
                "premium",
            ),
            rule(
                "claude-anywhere",
                10,
                RuleCondition::ModelPrefix {
                    prefix: "claude-".to_string(),
                },
                ANY_CHANNEL,
            ),
        ];

        let decision = evaluate(&rules, &ctx("claude-opus-4")).unwrap();
        assert_eq!(decision.target, RouteTarget::Named("premium".to_string()));
        assert_eq!(decision.rule, "opus-premium");

        let decision = evaluate(&rules, &ctx("claude-sonnet-4")).unwrap();
        assert_eq!(decision.target, RouteTarget::Any);
    }

    #[test]
    fn test_disabled_rule_never_fires() {
        let mut r = rule(
            "off",
            100,
            RuleCondition::ModelEquals {
                model: "claude-opus-4".to_string(),
            },
            "premium",
        );
        r.enabled = false;
        assert!(evaluate(&[r], &ctx("claude-opus-4")).is_none());
    }

    #[test]
    fn test_no_match_returns_none() {
        let rules = vec![rule(
            "gpt-only",
            1,
            RuleCondition::ModelPrefix {
                prefix: "gpt-".to_string(),
            },
            "openai",
        )];
        assert!(evaluate(&rules, &ctx("claude-opus-4")).is_none());
    }

    #[test]
    fn test_header_match_is_case_insensitive_on_name() {
        let mut context = ctx("claude-opus-4");
        context
            .headers
            .insert("x-team".to_string(), "research".to_string());

        assert!(matches(
            &RuleCondition::HeaderEquals {
                name: "X-Team".to_string(),
                value: "research".to_string(),
            },
            &context
        ));
        assert!(!matches(
            &RuleCondition::HeaderEquals {
                name: "x-team".to_string(),
                value: "Research".to_string(),
            },
            &context
        ));
    }

    #[test]
    fn test_user_path_and_tag_conditions() {
        let mut context = ctx("m");
        context.user_id = Some("user-7".to_string());
        context.tags = vec!["batch".to_string()];

        assert!(matches(
            &RuleCondition::UserEquals {
                user: "user-7".to_string()
            },
            &context
        ));
        assert!(matches(
            &RuleCondition::PathPrefix {
                prefix: "/v1/".to_string()
            },
            &context
        ));
        assert!(matches(
            &RuleCondition::HasTag {
                tag: "batch".to_string()
            },
            &context
        ));
        assert!(!matches(
            &RuleCondition::HasTag {
                tag: "interactive".to_string()
            },
            &context
        ));
    }

    #[test]
    fn test_model_override_carried() {
        let mut r = rule(
            "downgrade",
            1,
            RuleCondition::ModelEquals {
                model: "claude-opus-4".to_string(),
            },
            ANY_CHANNEL,
        );
        r.target_model = Some("claude-sonnet-4".to_string());

        let decision = evaluate(&[r], &ctx("claude-opus-4")).unwrap();
        assert_eq!(decision.model.as_deref(), Some("claude-sonnet-4"));
    }
}
