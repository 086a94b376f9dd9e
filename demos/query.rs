use std::{
    io::{stdout, BufWriter, Write},
    time::Instant,
};

use anyhow::{bail, Result};
use bbix::{
    BbiReader, BedLayout, FileKind, MmapSource, RangeQuery, Record, RecordFormat, TileCache,
    TileCacheConfig,
};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct Args {
    /// Input bigBed or bigWig file
    #[clap(required = true)]
    path: String,
    /// Chromosome to query
    #[clap(required_unless_present = "name")]
    chrom: Option<String>,
    /// 0-based start of the query window
    #[clap(default_value_t = 0)]
    start: u32,
    /// Exclusive end of the query window (defaults to the chromosome length)
    end: Option<u32>,
    /// Read bigBed rows with the methylation column layout
    #[clap(long)]
    methylation: bool,
    /// Search the name index instead of running a range query
    #[clap(long, conflicts_with = "chrom")]
    name: Option<String>,
    /// Route the query through a tile cache with this tile width
    #[clap(long)]
    tile_size: Option<u32>,
    #[clap(long, default_value_t = 1_000)]
    max_tiles: usize,
    /// Number of times to repeat the query (useful with a tile cache)
    #[clap(long, default_value_t = 1)]
    repeat: usize,
}

fn write_record<W: Write>(out: &mut W, chrom: &str, record: &Record) -> Result<()> {
    write!(out, "{}\t{}\t{}\t{}", chrom, record.start, record.end, record.score)?;
    if let Some(count) = record.count {
        write!(out, "\t{}\t{}", record.strand.as_char(), count)?;
    }
    writeln!(out)?;
    Ok(())
}

fn run<Q: RangeQuery>(q: &Q, chrom: &str, start: u32, end: u32, repeat: usize) -> Result<usize> {
    let mut out = BufWriter::new(stdout().lock());
    let mut total = 0;
    for pass in 0..repeat {
        for record in q.query(chrom, start, end)? {
            let record = record?;
            if pass == 0 {
                write_record(&mut out, chrom, &record)?;
            }
            total += 1;
        }
    }
    out.flush()?;
    Ok(total)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let mut reader = BbiReader::<MmapSource>::from_path(&args.path)?;
    if args.methylation {
        reader = reader.with_format(RecordFormat::Bed(BedLayout::methylation()));
    }
    eprintln!(
        "{:?} file with {} chromosomes and {} zoom levels",
        reader.kind(),
        reader.chroms().len(),
        reader.zoom_headers().len()
    );

    if let Some(name) = &args.name {
        if reader.kind() != FileKind::BigBed {
            bail!("name search requires a bigBed file");
        }
        let mut out = BufWriter::new(stdout().lock());
        for record in reader.search_name(name)? {
            let chrom = reader.chrom_name(record.chrom_id).unwrap_or("?");
            write_record(&mut out, chrom, &record)?;
        }
        out.flush()?;
        return Ok(());
    }

    let Some(chrom) = args.chrom.as_deref() else {
        bail!("a chromosome is required for range queries");
    };
    let end = match args.end {
        Some(end) => end,
        None => match reader.chrom(chrom)? {
            Some(info) => info.length,
            None => bail!("unknown chromosome: {chrom}"),
        },
    };

    let start_time = Instant::now();
    let total = match args.tile_size {
        Some(tile_size) => {
            let config = TileCacheConfig::new(args.max_tiles, tile_size);
            let cache = TileCache::new(reader, config)?;
            let total = run(&cache, chrom, args.start, end, args.repeat)?;
            eprintln!("Cache: {:?}", cache.stats());
            total
        }
        None => run(&reader, chrom, args.start, end, args.repeat)?,
    };
    let elapsed = start_time.elapsed();

    eprintln!("Returned {} records over {} passes", total, args.repeat);
    eprintln!("Elapsed time: {:?}", elapsed);

    Ok(())
}
