use criterion::{black_box, criterion_group, criterion_main, Criterion};
use knowledge_ingest::chunker::{chunk, reassemble};
use knowledge_ingest::normalizer::{reflow, render_pages, COLUMNS};

fn build_document(paragraphs: usize) -> String {
    (0..paragraphs)
        .map(|i| {
            format!(
                "Paragraph {} covers shipping, returns and warranty terms for order group {}. \
                 Customers should contact support with their order number.",
                i,
                i % 17
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn bench_chunk(c: &mut Criterion) {
    let text = build_document(2_000);

    c.bench_function("chunk_2000_paragraphs", |b| {
        b.iter(|| black_box(chunk(black_box(&text), 1_000)));
    });

    let chunks = chunk(&text, 1_000);
    c.bench_function("reassemble_2000_paragraphs", |b| {
        b.iter(|| black_box(reassemble(black_box(&chunks))));
    });
}

fn bench_render(c: &mut Criterion) {
    let lines = reflow(&build_document(200), COLUMNS);

    c.bench_function("render_pdf_200_paragraphs", |b| {
        b.iter(|| black_box(render_pages(black_box(&lines)).expect("render succeeds")));
    });
}

criterion_group!(benches, bench_chunk, bench_render);
criterion_main!(benches);
