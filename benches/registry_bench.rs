//! 扩展注册表性能基准测试
//!
//! 使用 Criterion 框架进行性能测试，包括：
//! - 集合快照读取基准
//! - 映射查找基准
//! - 热重载时的句柄原地替换基准
//! - 依赖排序基准

use chips_plugins::extension::{provider, DynamicMap, DynamicSet, ReloadableHandle};
use chips_plugins::plugin::{Dependency, DependencyResolver, PluginDescriptor};
use chips_plugins::{Key, Qualifier};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

const LISTENERS: &str = "bench.EventListener";
const COMMANDS: &str = "bench.Command";

// ============================================================================
// 集合读取
// ============================================================================

/// 不同大小集合的快照读取
fn set_snapshot_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("set_snapshot");

    for size in [1usize, 16, 256] {
        let set = DynamicSet::new(LISTENERS);
        let handles: Vec<_> = (0..size)
            .map(|i| {
                set.add(
                    &format!("plugin{}", i % 8),
                    Key::qualified(LISTENERS, Qualifier::unique()),
                    provider::instance(i),
                )
            })
            .collect();

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &set, |b, set| {
            b.iter(|| black_box(set.snapshot()).len());
        });
        drop(handles);
    }

    group.finish();
}

/// 读取并向下转型全部扩展
fn set_get_all_benchmark(c: &mut Criterion) {
    let set = DynamicSet::new(LISTENERS);
    let _handles: Vec<_> = (0..64)
        .map(|i| {
            set.add(
                "plugin",
                Key::qualified(LISTENERS, Qualifier::unique()),
                provider::instance(format!("listener-{}", i)),
            )
        })
        .collect();

    c.bench_function("set_get_all_as", |b| {
        b.iter(|| black_box(set.get_all_as::<String>()).len());
    });
}

// ============================================================================
// 映射查找
// ============================================================================

/// 插件作用域映射与全局映射的查找
fn map_lookup_benchmark(c: &mut Criterion) {
    let scoped = DynamicMap::new(COMMANDS);
    let global = DynamicMap::global(COMMANDS);
    let mut handles = Vec::new();
    for i in 0..128 {
        let plugin = format!("plugin{}", i % 16);
        let export = format!("cmd{}", i);
        handles.push(scoped.put(&plugin, &export, provider::instance(i)).unwrap());
        handles.push(global.put(&plugin, &export, provider::instance(i)).unwrap());
    }

    c.bench_function("map_get_scoped", |b| {
        b.iter(|| scoped.get(black_box("plugin4"), black_box("cmd100")));
    });

    c.bench_function("map_lookup_global", |b| {
        b.iter(|| global.lookup(black_box("cmd100")));
    });
}

// ============================================================================
// 热重载
// ============================================================================

/// 句柄原地替换提供者
fn handle_replace_benchmark(c: &mut Criterion) {
    let set = DynamicSet::new(LISTENERS);
    let key = Key::qualified(LISTENERS, Qualifier::named("audit"));
    let handle = set.add("plugin", key.clone(), provider::instance(0u64));

    let mut generation = 0u64;
    c.bench_function("set_handle_replace", |b| {
        b.iter(|| {
            generation += 1;
            handle.replace(key.clone(), provider::instance(generation))
        });
    });
}

// ============================================================================
// 依赖排序
// ============================================================================

/// 链式与扇出依赖的排序
fn dependency_resolve_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("dependency_resolve");

    for size in [10usize, 100, 1000] {
        // 每个插件依赖前一个插件的一半位置，形成树状依赖
        let descriptors: Vec<PluginDescriptor> = (0..size)
            .map(|i| {
                let desc = PluginDescriptor::new(format!("plugin{}", i), "1.0.0");
                if i == 0 {
                    desc
                } else {
                    desc.with_dependency(Dependency::new(format!("plugin{}", i / 2)))
                }
            })
            .collect();

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &descriptors, |b, d| {
            let resolver = DependencyResolver::new();
            b.iter(|| resolver.resolve(black_box(d.iter())).unwrap().len());
        });
    }

    group.finish();
}

// ============================================================================
// 基准测试组配置
// ============================================================================

criterion_group!(
    name = registry_benches;
    config = Criterion::default().sample_size(100);
    targets = set_snapshot_benchmark, set_get_all_benchmark, map_lookup_benchmark, handle_replace_benchmark
);

criterion_group!(
    name = dependency_benches;
    config = Criterion::default().sample_size(50);
    targets = dependency_resolve_benchmark
);

criterion_main!(registry_benches, dependency_benches);

