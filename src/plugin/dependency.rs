//! 插件依赖管理
//!
//! 本模块提供插件依赖关系图与解析器。
//!
//! # 主要组件
//!
//! - [`DependencyGraph`] - 依赖关系图，计算加载顺序与受影响子图
//! - [`DependencyResolver`] - 依赖解析器，从插件描述构建依赖图并检查缺失与版本
//!
//! # 示例
//!
//! ```rust
//! use chips_plugins::plugin::dependency::DependencyGraph;
//!
//! let mut graph = DependencyGraph::new();
//! graph.add_plugin("reviewers");
//! graph.add_plugin("accounts");
//! graph.add_dependency("reviewers", "accounts");
//!
//! assert_eq!(graph.load_order().unwrap(), vec!["accounts", "reviewers"]);
//! ```

use std::collections::{HashMap, HashSet};

use semver::Version;

use super::metadata::PluginDescriptor;
use crate::utils::{PluginError, Result};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Expanded,
}

/// 插件依赖关系图
///
/// 边的方向为依赖方 → 被依赖方。节点保留加入顺序，
/// 相互独立的插件按发现顺序排列。
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// 节点（加入顺序）
    nodes: Vec<String>,
    /// 正向边：插件 -> 它依赖的插件
    edges: HashMap<String, Vec<String>>,
    /// 反向边：插件 -> 依赖它的插件
    reverse_edges: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// 创建空的依赖图
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加插件节点，已存在时忽略
    pub fn add_plugin(&mut self, name: &str) {
        if !self.edges.contains_key(name) {
            self.nodes.push(name.to_string());
            self.edges.insert(name.to_string(), Vec::new());
            self.reverse_edges.insert(name.to_string(), Vec::new());
        }
    }

    /// 添加依赖关系：`plugin` 依赖 `dependency`
    ///
    /// 不存在的节点会自动添加。
    pub fn add_dependency(&mut self, plugin: &str, dependency: &str) {
        self.add_plugin(plugin);
        self.add_plugin(dependency);

        if let Some(deps) = self.edges.get_mut(plugin) {
            if !deps.iter().any(|d| d == dependency) {
                deps.push(dependency.to_string());
            }
        }
        if let Some(rev) = self.reverse_edges.get_mut(dependency) {
            if !rev.iter().any(|d| d == plugin) {
                rev.push(plugin.to_string());
            }
        }
    }

    /// 移除插件及其所有边
    pub fn remove_plugin(&mut self, name: &str) {
        if let Some(deps) = self.edges.remove(name) {
            for dep in deps {
                if let Some(rev) = self.reverse_edges.get_mut(&dep) {
                    rev.retain(|d| d != name);
                }
            }
        }
        if let Some(dependents) = self.reverse_edges.remove(name) {
            for dependent in dependents {
                if let Some(deps) = self.edges.get_mut(&dependent) {
                    deps.retain(|d| d != name);
                }
            }
        }
        self.nodes.retain(|n| n != name);
    }

    /// 是否包含插件
    pub fn contains(&self, name: &str) -> bool {
        self.edges.contains_key(name)
    }

    /// 节点数量
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// 全部插件（加入顺序）
    pub fn plugins(&self) -> &[String] {
        &self.nodes
    }

    /// 直接依赖
    pub fn dependencies(&self, name: &str) -> &[String] {
        self.edges.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// 直接依赖方
    pub fn dependents(&self, name: &str) -> &[String] {
        self.reverse_edges.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// 所有直接与间接依赖方
    pub fn all_dependents(&self, name: &str) -> HashSet<String> {
        let mut result = HashSet::new();
        let mut stack: Vec<&str> = vec![name];
        while let Some(node) = stack.pop() {
            for dependent in self.dependents(node) {
                if result.insert(dependent.clone()) {
                    stack.push(dependent);
                }
            }
        }
        result
    }

    /// 计算加载顺序
    ///
    /// 在反向图上做深度优先搜索：节点的所有后继（依赖方）完全展开后才把它加入结果，
    /// 最后反转结果，使每个依赖都排在依赖方之前。复杂度 O(V+E)。
    ///
    /// # Errors
    ///
    /// 存在环时返回 `CyclicDependency`，错误中给出环上的一个插件，不返回部分顺序。
    pub fn load_order(&self) -> Result<Vec<String>> {
        let mut marks: HashMap<&str, Mark> = HashMap::with_capacity(self.nodes.len());
        let mut result: Vec<String> = Vec::with_capacity(self.nodes.len());

        for node in &self.nodes {
            self.visit(node, &mut marks, &mut result)?;
        }

        result.reverse();
        Ok(result)
    }

    fn visit<'a>(
        &'a self,
        node: &'a str,
        marks: &mut HashMap<&'a str, Mark>,
        result: &mut Vec<String>,
    ) -> Result<()> {
        match marks.get(node) {
            Some(Mark::Expanded) => return Ok(()),
            Some(Mark::Visiting) => return Err(PluginError::CyclicDependency(node.to_string())),
            None => {}
        }

        marks.insert(node, Mark::Visiting);
        for dependent in self.dependents(node) {
            self.visit(dependent, marks, result)?;
        }
        marks.insert(node, Mark::Expanded);
        result.push(node.to_string());
        Ok(())
    }

    /// 计算需要重新处理的有序子图
    ///
    /// 返回变更插件及其所有依赖方，按全局加载顺序排列，不相关的插件不出现在结果中。
    pub fn affected_subgraph(&self, changed: &[String]) -> Result<Vec<String>> {
        let mut affected: HashSet<String> = HashSet::new();
        for name in changed.iter().filter(|n| self.contains(n)) {
            affected.insert(name.clone());
            affected.extend(self.all_dependents(name));
        }
        Ok(self
            .load_order()?
            .into_iter()
            .filter(|n| affected.contains(n))
            .collect())
    }

    /// 卸载顺序：依赖方先于被依赖方
    pub fn unload_order(&self, names: &[String]) -> Result<Vec<String>> {
        let wanted: HashSet<&String> = names.iter().collect();
        let mut order: Vec<String> = self
            .load_order()?
            .into_iter()
            .filter(|n| wanted.contains(n))
            .collect();
        order.reverse();
        Ok(order)
    }
}

/// 依赖解析器
///
/// 从插件描述构建依赖图。依赖必须出现在本批描述中或已登记为外部插件，
/// 否则整批解析失败。
#[derive(Debug, Clone, Default)]
pub struct DependencyResolver {
    /// 本批之外已知存在的插件（名称 -> 版本）
    external: HashMap<String, Option<Version>>,
}

impl DependencyResolver {
    /// 创建解析器
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记本批之外已知存在的插件
    ///
    /// 这些插件满足依赖检查，但不参与排序。
    pub fn with_external(mut self, name: impl Into<String>, version: Option<Version>) -> Self {
        self.external.insert(name.into(), version);
        self
    }

    /// 构建依赖图
    ///
    /// # Errors
    ///
    /// - 依赖不存在时返回 `MissingDependency`
    /// - 依赖版本不满足要求时返回 `IncompatibleDependency`
    pub fn build_graph<'a, I>(&self, descriptors: I) -> Result<DependencyGraph>
    where
        I: IntoIterator<Item = &'a PluginDescriptor>,
    {
        let descriptors: Vec<&PluginDescriptor> = descriptors.into_iter().collect();
        let versions: HashMap<&str, Option<Version>> = descriptors
            .iter()
            .map(|d| (d.name.as_str(), d.parsed_version()))
            .collect();

        let mut graph = DependencyGraph::new();
        for desc in &descriptors {
            graph.add_plugin(&desc.name);
        }

        for desc in &descriptors {
            for dep in desc.dependencies() {
                let found = match versions.get(dep.name.as_str()) {
                    Some(v) => {
                        graph.add_dependency(&desc.name, &dep.name);
                        v.clone()
                    }
                    None => match self.external.get(&dep.name) {
                        Some(v) => v.clone(),
                        None => {
                            return Err(PluginError::MissingDependency {
                                plugin: desc.name.clone(),
                                dependency: dep.name.clone(),
                            })
                        }
                    },
                };

                if let (Some(req), Some(version)) = (dep.version.as_ref(), found.as_ref()) {
                    if !dep.version_matches(version) {
                        return Err(PluginError::IncompatibleDependency {
                            plugin: desc.name.clone(),
                            dependency: dep.name.clone(),
                            required: req.clone(),
                            found: version.to_string(),
                        });
                    }
                }
            }
        }

        Ok(graph)
    }

    /// 解析加载顺序
    ///
    /// # Errors
    ///
    /// `MissingDependency`、`IncompatibleDependency` 或 `CyclicDependency`
    pub fn resolve<'a, I>(&self, descriptors: I) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = &'a PluginDescriptor>,
    {
        self.build_graph(descriptors)?.load_order()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::metadata::Dependency;

    fn desc(name: &str, deps: &[&str]) -> PluginDescriptor {
        deps.iter().fold(PluginDescriptor::new(name, "1.0.0"), |d, dep| {
            d.with_dependency(Dependency::new(*dep))
        })
    }

    fn index(order: &[String], name: &str) -> usize {
        order.iter().position(|n| n == name).unwrap()
    }

    #[test]
    fn test_scan_order_independent() {
        // 发现顺序 R, P, Q
        let descriptors = vec![desc("R", &["Q"]), desc("P", &[]), desc("Q", &["P"])];
        let order = DependencyResolver::new().resolve(&descriptors).unwrap();
        assert_eq!(order, vec!["P", "Q", "R"]);
    }

    #[test]
    fn test_every_edge_respected() {
        let descriptors = vec![
            desc("web", &["core", "auth"]),
            desc("auth", &["core"]),
            desc("metrics", &[]),
            desc("core", &[]),
            desc("admin", &["web", "metrics"]),
        ];
        let graph = DependencyResolver::new().build_graph(&descriptors).unwrap();
        let order = graph.load_order().unwrap();
        assert_eq!(order.len(), 5);
        for d in &descriptors {
            for dep in d.dependency_names() {
                assert!(index(&order, dep) < index(&order, &d.name));
            }
        }
    }

    #[test]
    fn test_missing_dependency() {
        let descriptors = vec![desc("P", &[]), desc("R", &["Q"])];
        let err = DependencyResolver::new().resolve(&descriptors).unwrap_err();
        match err {
            PluginError::MissingDependency { plugin, dependency } => {
                assert_eq!(plugin, "R");
                assert_eq!(dependency, "Q");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_external_satisfies_dependency() {
        let descriptors = vec![desc("R", &["Q"])];
        let order = DependencyResolver::new()
            .with_external("Q", None)
            .resolve(&descriptors)
            .unwrap();
        assert_eq!(order, vec!["R"]);
    }

    #[test]
    fn test_cycle_detected_without_partial_order() {
        let descriptors = vec![
            desc("free", &[]),
            desc("a", &["c"]),
            desc("b", &["a"]),
            desc("c", &["b"]),
        ];
        let err = DependencyResolver::new().resolve(&descriptors).unwrap_err();
        match err {
            PluginError::CyclicDependency(member) => {
                assert!(["a", "b", "c"].contains(&member.as_str()));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_incompatible_version() {
        let descriptors = vec![
            PluginDescriptor::new("core", "1.4.0"),
            PluginDescriptor::new("ext", "1.0.0")
                .with_dependency(Dependency::new("core").with_version("^2")),
        ];
        let err = DependencyResolver::new().resolve(&descriptors).unwrap_err();
        assert!(matches!(err, PluginError::IncompatibleDependency { ref found, .. } if found == "1.4.0"));
        assert!(err.is_resolution_error());
    }

    #[test]
    fn test_affected_subgraph() {
        let mut graph = DependencyGraph::new();
        for n in ["unrelated", "P", "Q", "R", "S"] {
            graph.add_plugin(n);
        }
        graph.add_dependency("Q", "P");
        graph.add_dependency("R", "Q");
        graph.add_dependency("S", "P");

        let affected = graph.affected_subgraph(&["Q".to_string()]).unwrap();
        assert_eq!(affected, vec!["Q", "R"]);

        let affected = graph.affected_subgraph(&["P".to_string()]).unwrap();
        assert_eq!(affected.len(), 4);
        assert_eq!(affected[0], "P");
        assert!(!affected.contains(&"unrelated".to_string()));
    }

    #[test]
    fn test_unload_order_reverse() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency("R", "Q");
        graph.add_dependency("Q", "P");
        let all = vec!["P".to_string(), "Q".to_string(), "R".to_string()];
        assert_eq!(graph.unload_order(&all).unwrap(), vec!["R", "Q", "P"]);
    }

    #[test]
    fn test_remove_plugin() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency("a", "b");
        graph.add_dependency("c", "b");
        graph.remove_plugin("b");
        assert!(!graph.contains("b"));
        assert!(graph.dependencies("a").is_empty());
        assert_eq!(graph.len(), 2);
    }
}
