use std::sync::Arc;
use std::time::Instant;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use kyro_consolidate::similarity::lexical_score;
use kyro_consolidate::{
    ConsolidationAgent, ConsolidationConfig, EntityKind, EntityStore, ExtractedEntity, NewSource,
    SourceId,
};

const SYSTEMS: [&str; 8] = [
    "Excel",
    "SAP ERP",
    "Salesforce CRM",
    "Jira",
    "Workday",
    "NetSuite",
    "ServiceNow",
    "Power BI",
];

const PAINS: [&str; 6] = [
    "Manual invoice reconciliation",
    "Slow month-end close",
    "Duplicate data entry",
    "Approvals stuck in email",
    "No single view of the customer",
    "Reports built by hand every week",
];

/// One interview worth of records. Variant spellings make later interviews
/// merge into earlier ones.
fn interview(n: usize) -> Vec<ExtractedEntity> {
    let prefix = ["", "Microsoft ", "the "][n % 3];
    let mut batch: Vec<ExtractedEntity> = SYSTEMS
        .iter()
        .map(|name| {
            ExtractedEntity::new("system")
                .field("name", format!("{prefix}{name}"))
                .field("criticality", ["High", "Medium"][n % 2])
        })
        .collect();
    batch.extend(PAINS.iter().map(|d| {
        ExtractedEntity::new("pain_point")
            .field("description", *d)
            .field("severity", ["High", "Critical", "Low"][n % 3])
    }));
    batch
}

fn seeded_agent(interviews: usize) -> (ConsolidationAgent, Vec<SourceId>) {
    let config = ConsolidationConfig::default().with_threshold(EntityKind::System, 0.75);
    let agent = ConsolidationAgent::new(Arc::new(EntityStore::in_memory()), config).unwrap();
    let sources: Vec<SourceId> = (0..=interviews)
        .map(|n| {
            agent
                .register_source(NewSource::new(format!("Interview {n}")).company(format!("Co {n}")))
                .unwrap()
        })
        .collect();
    for (n, source) in sources.iter().take(interviews).enumerate() {
        agent.consolidate(interview(n), *source).unwrap();
    }
    (agent, sources)
}

fn bench_lexical_score(c: &mut Criterion) {
    c.bench_function("similarity/lexical_score", |b| {
        b.iter(|| {
            lexical_score(
                std::hint::black_box("Manual invoice reconciliation in Excel"),
                std::hint::black_box("manual reconciliation of invoices"),
                0.8,
            )
        });
    });
}

fn bench_batch_into_populated_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("consolidate_batch");
    group.throughput(Throughput::Elements((SYSTEMS.len() + PAINS.len()) as u64));

    for seeded in [1usize, 8, 32] {
        group.bench_with_input(BenchmarkId::from_parameter(seeded), &seeded, |b, &seeded| {
            b.iter_custom(|iters| {
                let mut total = std::time::Duration::ZERO;
                for _ in 0..iters {
                    // Fresh store per iteration; each run mutates it.
                    let (agent, sources) = seeded_agent(seeded);
                    let batch = interview(seeded);
                    let start = Instant::now();
                    agent.consolidate(batch, sources[seeded]).unwrap();
                    total += start.elapsed();
                }
                total
            });
        });
    }
    group.finish();
}

fn bench_rollback(c: &mut Criterion) {
    c.bench_function("rollback/latest_merge", |b| {
        b.iter_custom(|iters| {
            let mut total = std::time::Duration::ZERO;
            for _ in 0..iters {
                let (agent, _) = seeded_agent(2);
                let audit = agent.list_audits(None, None).unwrap().last().unwrap().id;
                let start = Instant::now();
                agent.rollback(audit, "bench").unwrap();
                total += start.elapsed();
            }
            total
        });
    });
}

criterion_group!(
    consolidation,
    bench_lexical_score,
    bench_batch_into_populated_store,
    bench_rollback
);
criterion_main!(consolidation);
