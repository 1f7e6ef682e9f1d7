use paio_engine::{
    Dataset, DatasetOptions, Error, ExtType, FileIo, FormatVariant, Layout, LocalFile, MemType,
    Selector, SoloComm, UNLIMITED,
};

/// Fixed 8x6 i32 grid, a 12-element i16 vector, and one unlimited f64
/// series of 4 elements per record (so `recsize == 32`).
fn layout() -> Layout {
    Layout::builder(16)
        .var("grid", ExtType::I32, &[8, 6])
        .var("cell", ExtType::I16, &[12])
        .var("series", ExtType::F64, &[UNLIMITED, 4])
        .build(FormatVariant::Offset64)
        .unwrap()
}

fn solo(path: &std::path::Path) -> Dataset {
    let fio = LocalFile::create(path).unwrap();
    Dataset::new(
        layout(),
        0,
        Box::new(fio),
        Box::new(SoloComm),
        DatasetOptions::default(),
    )
}

fn f64_bytes(vals: &[f64]) -> Vec<u8> {
    vals.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

fn i16_bytes(vals: &[i16]) -> Vec<u8> {
    vals.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

fn as_i32(buf: &[u8]) -> Vec<i32> {
    buf.chunks_exact(4)
        .map(|b| i32::from_ne_bytes(b.try_into().unwrap()))
        .collect()
}

fn as_i16(buf: &[u8]) -> Vec<i16> {
    buf.chunks_exact(2)
        .map(|b| i16::from_ne_bytes(b.try_into().unwrap()))
        .collect()
}

#[test]
fn strided_write_then_read_back_with_conversion() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut ds = solo(&dir.path().join("data"));
    let grid = ds.var("grid").unwrap().clone();

    // A 3x3 block over rows 1,3,5 and columns 0,2,4, posted from f64
    // memory into the i32 variable.
    let vals: Vec<f64> = (0..9).map(|k| (k * 11) as f64).collect();
    let id = ds.write_strided(
        &grid,
        &[1, 0],
        &[3, 3],
        &[2, 2],
        f64_bytes(&vals),
        MemType::F64,
    )?;
    let out = ds.wait_all(Selector::Ids(&[id]))?;
    assert!(out.status.is_ok());
    assert_eq!(out.completions.len(), 1);
    assert!(out.completions[0].status.is_ok());
    // The posted buffer comes back unchanged.
    assert_eq!(out.completions[0].buf.as_ref().unwrap(), &f64_bytes(&vals));
    assert_eq!(ds.bytes_written(), 9 * 4);

    // Same slab back through the strided path.
    let id = ds.read_strided(
        &grid,
        &[1, 0],
        &[3, 3],
        &[2, 2],
        vec![0u8; 9 * 4],
        MemType::I32,
    )?;
    let out = ds.wait_all(Selector::Ids(&[id]))?;
    let got = as_i32(out.completions[0].buf.as_ref().unwrap());
    let want: Vec<i32> = (0..9).map(|k| k * 11).collect();
    assert_eq!(got, want);

    // The untouched rest of the variable reads as zero, and the written
    // elements sit exactly where row-major flattening says they should.
    let id = ds.read_subarray(&grid, &[0, 0], &[8, 6], vec![0u8; 48 * 4], MemType::I32)?;
    let out = ds.wait_all(Selector::Ids(&[id]))?;
    let full = as_i32(out.completions[0].buf.as_ref().unwrap());
    for r in 0..8 {
        for c in 0..6 {
            let expect = if r % 2 == 1 && r < 6 && c % 2 == 0 && c < 5 {
                let k = (r - 1) / 2 * 3 + c / 2;
                (k * 11) as i32
            } else {
                0
            };
            assert_eq!(full[r * 6 + c], expect, "element ({r},{c})");
        }
    }
    Ok(())
}

#[test]
fn overlapping_writes_keep_the_earlier_poster() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut ds = solo(&dir.path().join("data"));
    let cell = ds.var("cell").unwrap().clone();

    // [2..8) then [5..11): the overlap [5..8) belongs to the first poster.
    ds.write_subarray(
        &cell,
        &[2],
        &[6],
        i16_bytes(&[10, 11, 12, 13, 14, 15]),
        MemType::I16,
    )?;
    ds.write_subarray(
        &cell,
        &[5],
        &[6],
        i16_bytes(&[20, 21, 22, 23, 24, 25]),
        MemType::I16,
    )?;
    let out = ds.wait_all(Selector::All)?;
    assert!(out.status.is_ok());
    assert!(out.completions.iter().all(|c| c.status.is_ok()));

    let id = ds.read_subarray(&cell, &[0], &[12], vec![0u8; 24], MemType::I16)?;
    let out = ds.wait_all(Selector::Ids(&[id]))?;
    let got = as_i16(out.completions[0].buf.as_ref().unwrap());
    assert_eq!(got, [0, 0, 10, 11, 12, 13, 14, 15, 23, 24, 25, 0]);
    Ok(())
}

#[test]
fn record_writes_grow_and_persist_the_record_count() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("data");
    let mut ds = solo(&path);
    let series = ds.var("series").unwrap().clone();

    let vals: Vec<f64> = (0..12).map(|k| k as f64 * 0.5).collect();
    ds.write_subarray(&series, &[0, 0], &[3, 4], f64_bytes(&vals), MemType::F64)?;
    let out = ds.wait_all(Selector::All)?;
    assert!(out.status.is_ok());
    assert_eq!(ds.num_records(), 3);

    // The on-disk count lives at the layout's offset, big-endian.
    let mut f = LocalFile::open(&path)?;
    let mut raw = [0u8; 8];
    f.read_at(&mut raw, 4)?;
    assert_eq!(i64::from_be_bytes(raw), 3);

    let id = ds.read_subarray(&series, &[0, 0], &[3, 4], vec![0u8; 12 * 8], MemType::F64)?;
    let out = ds.wait_all(Selector::Ids(&[id]))?;
    let got: Vec<f64> = out.completions[0]
        .buf
        .as_ref()
        .unwrap()
        .chunks_exact(8)
        .map(|b| f64::from_ne_bytes(b.try_into().unwrap()))
        .collect();
    assert_eq!(got, vals);
    Ok(())
}

#[test]
fn multi_range_requests_share_one_id() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut ds = solo(&dir.path().join("data"));
    let cell = ds.var("cell").unwrap().clone();

    let (s0, c0) = ([0i64], [2i64]);
    let (s1, c1) = ([5i64], [1i64]);
    let (s2, c2) = ([8i64], [3i64]);
    let ranges: [(&[i64], &[i64]); 3] = [(&s0, &c0), (&s1, &c1), (&s2, &c2)];
    let id = ds.write_multi(
        &cell,
        &ranges,
        i16_bytes(&[1, 2, 3, 4, 5, 6]),
        MemType::I16,
    )?;
    let out = ds.wait_all(Selector::Ids(&[id]))?;
    assert_eq!(out.completions.len(), 1);
    assert!(out.completions[0].status.is_ok());
    assert_eq!(out.completions[0].buf.as_ref().unwrap().len(), 12);

    let id = ds.read_subarray(&cell, &[0], &[12], vec![0u8; 24], MemType::I16)?;
    let out = ds.wait_all(Selector::Ids(&[id]))?;
    let got = as_i16(out.completions[0].buf.as_ref().unwrap());
    assert_eq!(got, [1, 2, 0, 0, 0, 3, 0, 0, 4, 5, 6, 0]);

    // Reading the same ranges under one id lands them back to back.
    let id = ds.read_multi(&cell, &ranges, vec![0u8; 12], MemType::I16)?;
    let out = ds.wait_all(Selector::Ids(&[id]))?;
    let got = as_i16(out.completions[0].buf.as_ref().unwrap());
    assert_eq!(got, [1, 2, 3, 4, 5, 6]);
    Ok(())
}

#[test]
fn out_of_order_record_ranges_keep_one_lead() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut ds = solo(&dir.path().join("data"));
    let series = ds.var("series").unwrap().clone();

    // Record 3 posted first, then a span over records 0..3. The span
    // splits per record and sorts ahead of the first entry, which must
    // not confuse the release path about whose buffer comes back.
    let (s0, c0) = ([3i64, 0], [1i64, 4]);
    let (s1, c1) = ([0i64, 0], [3i64, 4]);
    let ranges: [(&[i64], &[i64]); 2] = [(&s0, &c0), (&s1, &c1)];
    let vals: Vec<f64> = (0..16).map(|k| k as f64).collect();
    let id = ds.write_multi(&series, &ranges, f64_bytes(&vals), MemType::F64)?;
    assert_eq!(ds.pending(), (4, 0));

    let out = ds.wait_all(Selector::Ids(&[id]))?;
    assert!(out.status.is_ok());
    assert_eq!(out.completions.len(), 1);
    // Exactly one handback, with the in-place swap undone.
    assert_eq!(out.completions[0].buf.as_ref().unwrap(), &f64_bytes(&vals));
    assert_eq!(ds.num_records(), 4);

    let id = ds.read_multi(&series, &ranges, vec![0u8; 16 * 8], MemType::F64)?;
    let out = ds.wait_all(Selector::Ids(&[id]))?;
    assert_eq!(out.completions[0].buf.as_ref().unwrap(), &f64_bytes(&vals));
    Ok(())
}

#[test]
fn mapped_writes_and_reads_transpose() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut ds = solo(&dir.path().join("data"));
    let grid = ds.var("grid").unwrap().clone();

    // The caller buffer is column-major 2x3; imap [1, 2] walks it in
    // row-major variable order.
    let col_major: Vec<i32> = vec![1, 4, 2, 5, 3, 6];
    let data: Vec<u8> = col_major.iter().flat_map(|v| v.to_ne_bytes()).collect();
    let id = ds.write_mapped(&grid, &[0, 0], &[2, 3], None, &[1, 2], data, MemType::I32)?;
    let out = ds.wait_all(Selector::Ids(&[id]))?;
    assert!(out.completions[0].status.is_ok());

    // On file the block is row-major 1..=6.
    let id = ds.read_subarray(&grid, &[0, 0], &[2, 3], vec![0u8; 24], MemType::I32)?;
    let out = ds.wait_all(Selector::Ids(&[id]))?;
    assert_eq!(as_i32(out.completions[0].buf.as_ref().unwrap()), [1, 2, 3, 4, 5, 6]);

    // And a mapped read scatters it back into column-major memory.
    let id = ds.read_mapped(
        &grid,
        &[0, 0],
        &[2, 3],
        None,
        &[1, 2],
        vec![0u8; 24],
        MemType::I32,
    )?;
    let out = ds.wait_all(Selector::Ids(&[id]))?;
    assert_eq!(as_i32(out.completions[0].buf.as_ref().unwrap()), col_major);
    Ok(())
}

#[test]
fn pooled_writes_release_the_caller_immediately() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut ds = solo(&dir.path().join("data"));
    let cell = ds.var("cell").unwrap().clone();

    ds.attach_pool(64)?;
    let mut src = i16_bytes(&[1, 2, 3, 4]);
    let id = ds.write_pooled(&cell, &[2], &[4], None, &src, MemType::I16)?;
    // The engine copied at posting time; the caller may clobber away.
    src.fill(0);

    let out = ds.wait_all(Selector::Ids(&[id]))?;
    assert!(out.status.is_ok());
    assert!(out.completions[0].buf.is_none());
    ds.detach_pool()?;

    let id = ds.read_subarray(&cell, &[2], &[4], vec![0u8; 8], MemType::I16)?;
    let out = ds.wait_all(Selector::Ids(&[id]))?;
    assert_eq!(as_i16(out.completions[0].buf.as_ref().unwrap()), [1, 2, 3, 4]);
    Ok(())
}

#[test]
fn out_of_range_writes_clamp_and_flag() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut ds = solo(&dir.path().join("data"));
    let cell = ds.var("cell").unwrap().clone();

    // 40000 does not fit an i16: the file gets the clamped value and the
    // round reports the range error, but the transfer still happens.
    let data: Vec<u8> = [40_000i32, 7, -40_000]
        .iter()
        .flat_map(|v| v.to_ne_bytes())
        .collect();
    let id = ds.write_subarray(&cell, &[0], &[3], data, MemType::I32)?;
    let out = ds.wait_all(Selector::Ids(&[id]))?;
    assert_eq!(out.status, Err(Error::Range));
    assert_eq!(out.completions[0].status, Err(Error::Range));
    assert!(out.completions[0].buf.is_some());

    let id = ds.read_subarray(&cell, &[0], &[3], vec![0u8; 6], MemType::I16)?;
    let out = ds.wait_all(Selector::Ids(&[id]))?;
    assert_eq!(
        as_i16(out.completions[0].buf.as_ref().unwrap()),
        [i16::MAX, 7, i16::MIN]
    );
    Ok(())
}

#[test]
fn out_of_range_reads_clamp_and_flag() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut ds = solo(&dir.path().join("data"));
    let grid = ds.var("grid").unwrap().clone();

    // Values legal for the i32 variable but too wide for i16 memory.
    let data: Vec<u8> = [100_000i32, 3, -100_000]
        .iter()
        .flat_map(|v| v.to_ne_bytes())
        .collect();
    let id = ds.write_subarray(&grid, &[0, 0], &[1, 3], data, MemType::I32)?;
    assert!(ds.wait_all(Selector::Ids(&[id]))?.status.is_ok());

    // Unpacking clamps; the slot and the round both report it, and the
    // clamped values still land in the caller's buffer.
    let id = ds.read_subarray(&grid, &[0, 0], &[1, 3], vec![0u8; 6], MemType::I16)?;
    let out = ds.wait_all(Selector::Ids(&[id]))?;
    assert_eq!(out.status, Err(Error::Range));
    assert_eq!(out.completions[0].status, Err(Error::Range));
    assert_eq!(
        as_i16(out.completions[0].buf.as_ref().unwrap()),
        [i16::MAX, 3, i16::MIN]
    );
    Ok(())
}

#[test]
fn cancelling_a_record_span_frees_every_entry() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut ds = solo(&dir.path().join("data"));
    let series = ds.var("series").unwrap().clone();

    // One id, three queued entries.
    let vals: Vec<f64> = (0..12).map(|k| k as f64).collect();
    let id = ds.write_subarray(&series, &[0, 0], &[3, 4], f64_bytes(&vals), MemType::F64)?;
    assert_eq!(ds.pending(), (3, 0));

    let out = ds.cancel(Selector::Ids(&[id]));
    assert!(out.status.is_ok());
    assert_eq!(out.completions.len(), 1);
    assert_eq!(out.completions[0].buf.as_ref().unwrap(), &f64_bytes(&vals));
    assert_eq!(ds.pending(), (0, 0));
    assert_eq!(ds.num_records(), 0);
    Ok(())
}

#[test]
fn cancelled_writes_never_touch_the_file() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut ds = solo(&dir.path().join("data"));
    let cell = ds.var("cell").unwrap().clone();

    let data = i16_bytes(&[7, 7, 7, 7]);
    let id = ds.write_subarray(&cell, &[0], &[4], data.clone(), MemType::I16)?;
    let out = ds.cancel(Selector::Ids(&[id]));
    assert!(out.status.is_ok());
    assert_eq!(out.completions[0].buf.as_ref().unwrap(), &data);

    let id = ds.read_subarray(&cell, &[0], &[4], vec![0u8; 8], MemType::I16)?;
    let out = ds.wait_all(Selector::Ids(&[id]))?;
    assert_eq!(as_i16(out.completions[0].buf.as_ref().unwrap()), [0, 0, 0, 0]);
    Ok(())
}

mod collective {
    use super::*;
    use paio_engine::{Communicator, LocalGroup};

    #[test]
    fn idle_ranks_stay_in_step_with_collective_commits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        LocalFile::create(&path).unwrap();

        std::thread::scope(|s| {
            for comm in LocalGroup::new(2) {
                let path = path.clone();
                s.spawn(move || {
                    let rank = comm.rank();
                    let fio = LocalFile::open(&path).unwrap();
                    let mut ds = Dataset::new(
                        layout(),
                        0,
                        Box::new(fio),
                        Box::new(comm),
                        DatasetOptions::default(),
                    );
                    let series = ds.var("series").unwrap().clone();
                    if rank == 0 {
                        let data = f64_bytes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
                        ds.write_subarray(&series, &[0, 0], &[2, 4], data, MemType::F64)
                            .unwrap();
                    }
                    // Rank 1 posted nothing but still joins the round.
                    let out = ds.wait_all(Selector::All).unwrap();
                    assert!(out.status.is_ok());
                    assert_eq!(ds.num_records(), 2);
                });
            }
        });

        let mut f = LocalFile::open(&path).unwrap();
        let mut raw = [0u8; 8];
        f.read_at(&mut raw, 4).unwrap();
        assert_eq!(i64::from_be_bytes(raw), 2);
    }

    #[test]
    fn record_growth_agrees_across_ranks() {
        use crossbeam_channel::RecvTimeoutError;
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        LocalFile::create(&path).unwrap();

        let (tx, rx) = crossbeam_channel::unbounded();
        std::thread::scope(|s| {
            for comm in LocalGroup::new(2) {
                let path = path.clone();
                let tx = tx.clone();
                s.spawn(move || {
                    let rank = comm.rank();
                    let fio = LocalFile::open(&path).unwrap();
                    let mut ds = Dataset::new(
                        layout(),
                        0,
                        Box::new(fio),
                        Box::new(comm),
                        DatasetOptions::default(),
                    );
                    let series = ds.var("series").unwrap().clone();

                    // Rank 0 writes record 5, rank 1 record 9; both must
                    // come out of the round knowing about all ten records.
                    let record: i64 = if rank == 0 { 5 } else { 9 };
                    let data = f64_bytes(&[record as f64; 4]);
                    ds.write_subarray(&series, &[record, 0], &[1, 4], data, MemType::F64)
                        .unwrap();
                    let out = ds.wait_all(Selector::All).unwrap();
                    assert!(out.status.is_ok());
                    tx.send((rank, ds.num_records())).unwrap();
                });
            }
            drop(tx);
            for _ in 0..2 {
                match rx.recv_timeout(Duration::from_secs(10)) {
                    Ok((rank, numrecs)) => assert_eq!(numrecs, 10, "rank {rank} disagrees"),
                    Err(RecvTimeoutError::Timeout) => {
                        panic!("a rank never finished its collective")
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        panic!("a rank died before reporting")
                    }
                }
            }
        });

        let mut f = LocalFile::open(&path).unwrap();
        let mut raw = [0u8; 8];
        f.read_at(&mut raw, 4).unwrap();
        assert_eq!(i64::from_be_bytes(raw), 10);
    }

    #[test]
    fn independent_epoch_syncs_the_record_count_at_exit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        LocalFile::create(&path).unwrap();

        std::thread::scope(|s| {
            for comm in LocalGroup::new(2) {
                let path = path.clone();
                s.spawn(move || {
                    let rank = comm.rank();
                    let fio = LocalFile::open(&path).unwrap();
                    let mut ds = Dataset::new(
                        layout(),
                        0,
                        Box::new(fio),
                        Box::new(comm),
                        DatasetOptions::default(),
                    );
                    let series = ds.var("series").unwrap().clone();

                    ds.begin_independent().unwrap();
                    if rank == 1 {
                        let data = f64_bytes(&[40.0, 41.0, 42.0, 43.0]);
                        let id = ds
                            .write_subarray(&series, &[4, 0], &[1, 4], data, MemType::F64)
                            .unwrap();
                        let out = ds.wait(Selector::Ids(&[id])).unwrap();
                        assert!(out.status.is_ok());
                        // Grown locally, not yet agreed on.
                        assert_eq!(ds.num_records(), 5);
                    }
                    ds.end_independent().unwrap();
                    assert_eq!(ds.num_records(), 5);
                });
            }
        });

        let mut f = LocalFile::open(&path).unwrap();
        let mut raw = [0u8; 8];
        f.read_at(&mut raw, 4).unwrap();
        assert_eq!(i64::from_be_bytes(raw), 5);
    }

    #[test]
    fn remote_errors_abort_the_round_without_deadlock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        LocalFile::create(&path).unwrap();

        std::thread::scope(|s| {
            for comm in LocalGroup::new(2) {
                let path = path.clone();
                s.spawn(move || {
                    let rank = comm.rank();
                    let fio = LocalFile::open(&path).unwrap();
                    let mut ds = Dataset::new(
                        layout(),
                        0,
                        Box::new(fio),
                        Box::new(comm),
                        DatasetOptions::default(),
                    );
                    let grid = ds.var("grid").unwrap().clone();
                    let cell = ds.var("cell").unwrap().clone();

                    // Round 1: rank 0 commits a real write.
                    let stale = if rank == 0 {
                        let id = ds
                            .write_subarray(
                                &grid,
                                &[0, 0],
                                &[1, 6],
                                i16_bytes(&[5, 5, 5, 5, 5, 5]),
                                MemType::I16,
                            )
                            .unwrap();
                        let out = ds.wait_all(Selector::Ids(&[id])).unwrap();
                        assert!(out.status.is_ok());
                        Some(id)
                    } else {
                        let out = ds.wait_all(Selector::All).unwrap();
                        assert!(out.status.is_ok());
                        None
                    };

                    // Round 2: rank 0 waits on the already-resolved id,
                    // which is a local error; rank 1 brings a valid write
                    // that the agreed abort sends back untransferred.
                    if rank == 0 {
                        let stale = stale.unwrap();
                        let out = ds.wait_all(Selector::Ids(&[stale])).unwrap();
                        assert!(out.status.is_err());
                        assert!(out.completions[0].status.is_err());
                    } else {
                        let data = i16_bytes(&[30, 31, 32, 33]);
                        ds.write_subarray(&cell, &[0], &[4], data.clone(), MemType::I16)
                            .unwrap();
                        let out = ds.wait_all(Selector::All).unwrap();
                        // The local verdict is clean; the buffer is back.
                        assert!(out.status.is_ok());
                        assert_eq!(out.completions[0].buf.as_ref().unwrap(), &data);
                        assert_eq!(ds.pending(), (0, 0));
                    }
                });
            }
        });

        // The aborted round wrote nothing: the cell variable is untouched.
        let mut f = LocalFile::open(&path).unwrap();
        let layout = layout();
        let cell_begin = layout.var("cell").unwrap().begin;
        let mut raw = vec![0u8; 24];
        f.read_at(&mut raw, cell_begin).unwrap();
        assert!(raw.iter().all(|&b| b == 0));
    }
}
