use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::Utc;
use deadstock_core::{AggregateId, ItemId, SiteId, StockManagementId};
use deadstock_events::execute;
use deadstock_review::{
    BulkSetDisposition, DeadstockReview, Disposition, ItemSnapshot, LoadSnapshot, Packaging,
    ReviewCommand, ReviewId, Role,
};

fn snapshot(item_id: i64) -> ItemSnapshot {
    ItemSnapshot {
        item_id: ItemId::new(item_id),
        stock_management_id: StockManagementId::new(item_id),
        part_number: format!("BM-{item_id}"),
        description: "bench line".to_string(),
        location_name: "BENCH".to_string(),
        supplier_name: "BENCH".to_string(),
        last_issue_date: None,
        qty_on_hand: 24,
        package_size: 10,
        unit_price_cents: 100,
        is_restockable: true,
        min_level: None,
        max_level: None,
    }
}

fn loaded_review(size: i64) -> (DeadstockReview, SiteId, ReviewId) {
    let site_id = SiteId::new(1);
    let review_id = ReviewId::new(AggregateId::new());
    let mut review = DeadstockReview::empty(review_id);
    let items = (1..=size).map(snapshot).collect();
    execute(
        &mut review,
        &ReviewCommand::LoadSnapshot(LoadSnapshot {
            site_id,
            review_id,
            items,
            occurred_at: Utc::now(),
        }),
    )
    .unwrap();
    (review, site_id, review_id)
}

fn bench_bulk_disposition(c: &mut Criterion) {
    let mut group = c.benchmark_group("bulk_set_disposition");
    for size in [100i64, 1_000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let (review, site_id, review_id) = loaded_review(size);
            let command = ReviewCommand::BulkSetDisposition(BulkSetDisposition {
                site_id,
                review_id,
                actor: Role::Customer,
                disposition: Disposition::Return,
                occurred_at: Utc::now(),
            });
            b.iter(|| {
                let mut fresh = review.clone();
                let events = execute(&mut fresh, &command).unwrap();
                black_box(events.len())
            });
        });
    }
    group.finish();
}

fn bench_quantity_snapping(c: &mut Criterion) {
    let packaging = Packaging::new(24_000, 12);
    c.bench_function("snap_qty_to_bill", |b| {
        b.iter(|| {
            let mut acc = 0i64;
            for raw in 0..1_000i64 {
                acc += packaging.snap_qty_to_bill(black_box(raw * 17 % 24_000)).unwrap();
            }
            black_box(acc)
        })
    });
}

criterion_group!(benches, bench_bulk_disposition, bench_quantity_snapping);
criterion_main!(benches);
