//! 虚拟主机证书别名选择。

use std::sync::Arc;

use spark_bridge::address::{KeySelectionContext, KeySelector};

/// 按主机名匹配别名的默认选择器。
///
/// # 教案式说明
/// - **意图 (Why)**：同一物理端点上的多个虚拟主机在握手前就要确定证书，
///   此时还没有读取任何客户端数据，只能依据“这个端点上绑定了哪些主机名”选择；
/// - **契约 (What)**：
///   - 按 `hosts` 的顺序，对每个主机名先找同名别名，再找匹配的通配别名（`*.example.com`）；
///   - 都没有命中时使用 `fallback` 别名（若存在于库中）；
///   - 服务端在库中只有一个身份时直接使用它；客户端不会在没有明确匹配时出示证书；
/// - **风险 (Trade-offs)**：多个主机共享端点但证书互不覆盖时只能服务其中一部分主机，
///   这类部署应使用包含全部主机名的证书，并以同名或 `fallback` 别名登记。
#[derive(Clone, Debug, Default)]
pub struct VirtualHostKeySelector {
    fallback: Option<Arc<str>>,
}

impl VirtualHostKeySelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// 没有主机名命中时使用的别名。
    pub fn with_fallback(alias: impl Into<Arc<str>>) -> Self {
        Self {
            fallback: Some(alias.into()),
        }
    }
}

impl KeySelector for VirtualHostKeySelector {
    fn select(&self, context: &KeySelectionContext<'_>) -> Option<Arc<str>> {
        for host in context.hosts {
            if let Some(alias) = context
                .aliases
                .iter()
                .find(|alias| alias.eq_ignore_ascii_case(host))
            {
                return Some(Arc::clone(alias));
            }
            if let Some(alias) = context
                .aliases
                .iter()
                .find(|alias| wildcard_matches(alias, host))
            {
                return Some(Arc::clone(alias));
            }
        }
        if let Some(fallback) = &self.fallback
            && context.aliases.contains(fallback)
        {
            return Some(Arc::clone(fallback));
        }
        match context.aliases {
            [only] if context.server => Some(Arc::clone(only)),
            _ => None,
        }
    }
}

/// `*.example.com` 只匹配恰好多一级的主机名。
fn wildcard_matches(pattern: &str, host: &str) -> bool {
    let Some(suffix) = pattern.strip_prefix("*.") else {
        return false;
    };
    match host.split_once('.') {
        Some((label, rest)) => !label.is_empty() && rest.eq_ignore_ascii_case(suffix),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(items: &[&str]) -> Vec<Arc<str>> {
        items.iter().map(|item| Arc::from(*item)).collect()
    }

    fn select(selector: &VirtualHostKeySelector, hosts: &[&str], aliases: &[&str], server: bool) -> Option<String> {
        let hosts = list(hosts);
        let aliases = list(aliases);
        selector
            .select(&KeySelectionContext {
                hosts: &hosts,
                aliases: &aliases,
                server,
            })
            .map(|alias| alias.to_string())
    }

    #[test]
    fn exact_match_wins_in_host_order() {
        let selector = VirtualHostKeySelector::new();
        let chosen = select(&selector, &["b.test", "a.test"], &["a.test", "b.test"], true);
        assert_eq!(chosen.as_deref(), Some("b.test"), "按主机顺序优先");
    }

    #[test]
    fn wildcard_matches_one_label() {
        let selector = VirtualHostKeySelector::new();
        assert_eq!(
            select(&selector, &["api.example.com"], &["*.example.com", "other"], true).as_deref(),
            Some("*.example.com")
        );
        assert_eq!(
            select(&selector, &["a.b.example.com"], &["*.example.com", "other"], true),
            None,
            "通配只覆盖一级"
        );
    }

    #[test]
    fn fallback_and_single_identity() {
        let selector = VirtualHostKeySelector::with_fallback("default");
        assert_eq!(
            select(&selector, &["x.test"], &["default", "y.test"], true).as_deref(),
            Some("default")
        );
        let plain = VirtualHostKeySelector::new();
        assert_eq!(select(&plain, &["x.test"], &["only"], true).as_deref(), Some("only"));
        assert_eq!(select(&plain, &["x.test"], &["only"], false), None, "客户端不盲目出示证书");
    }
}
