use afio_file::{AlignedBuffer, AsyncFile, AsyncFileConfig, OpenFlags, OpenParams, Page, Request};
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use rand::RngCore;
use std::path::Path;

const PAGE_SIZE: usize = 4096;
const N_PAGES: usize = 256;
const ALIGN: usize = 4096;

fn make_pages(data: &[u8]) -> Vec<Page> {
    data.chunks(PAGE_SIZE)
        .enumerate()
        .map(|(i, chunk)| {
            Page::new(
                AlignedBuffer::from_slice(chunk, ALIGN),
                (i * PAGE_SIZE) as u64,
            )
        })
        .collect()
}

fn write_file(file: &mut AsyncFile, path: &Path, pages: Vec<Page>) {
    let flags = OpenFlags::CREATE_IF_NONE | OpenFlags::TRUNCATE | OpenFlags::WRITE_ONLY;
    for mut request in [
        Request::open(OpenParams::new(path, flags), 0),
        Request::write(pages, 1),
        Request::close(2),
    ] {
        file.execute(&mut request);
        assert!(request.error.is_none(), "{request:?}");
    }
}

fn bench_write_coalescing(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let mut data = vec![0; PAGE_SIZE * N_PAGES];
    rand::thread_rng().fill_bytes(&mut data);

    let mut group = c.benchmark_group("write_coalescing");
    group.throughput(Throughput::Bytes(data.len() as u64));

    for (name, write_buffer_size) in [("coalesced", 256 * 1024), ("page_by_page", 0)] {
        let path = dir.path().join(name);
        let mut file = AsyncFile::new(AsyncFileConfig {
            write_buffer_size,
            ..Default::default()
        })
        .unwrap();
        group.bench_function(name, |b| {
            b.iter_batched(
                || make_pages(&data),
                |pages| write_file(&mut file, &path, pages),
                BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

criterion_group!(benches, bench_write_coalescing);
criterion_main!(benches);
