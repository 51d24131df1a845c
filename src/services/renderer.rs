//! PDF pages to PNG files, rendered in batches by external worker processes.

use crate::core::config::RenderConfig;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;

/// Contiguous inclusive batches covering `first..=last`.
pub fn plan_batches(first: u32, last: u32, batch_size: u32) -> Vec<(u32, u32)> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::new();
    let mut page = first;
    while page <= last {
        let end = page.saturating_add(batch_size - 1).min(last);
        batches.push((page, end));
        if end == u32::MAX {
            break;
        }
        page = end + 1;
    }
    batches
}

/// Clamps a requested `(start, end)` to `[1, total]`. An open end means the
/// last page. `None` when nothing is left to render.
pub fn resolve_range(requested: Option<(u32, Option<u32>)>, total: u32) -> Option<(u32, u32)> {
    let (start, end) = requested.unwrap_or((1, None));
    let first = start.max(1);
    let last = end.unwrap_or(total).min(total);
    if total == 0 || first > last {
        None
    } else {
        Some((first, last))
    }
}

/// Page number from a `page_{n:04}.png` style file name.
pub fn page_index(path: &Path) -> Option<u32> {
    path.file_stem()?
        .to_str()?
        .rsplit(|c: char| c == '_' || c == '-')
        .next()?
        .parse()
        .ok()
}

#[async_trait]
pub trait Rasterizer: Send + Sync {
    async fn page_count(&self, pdf: &Path) -> Result<u32>;

    /// Renders `first..=last` into `out_dir` as `page_{n:04}.png`.
    async fn render_batch(
        &self,
        pdf: &Path,
        out_dir: &Path,
        first: u32,
        last: u32,
        dpi: u32,
    ) -> Result<Vec<PathBuf>>;
}

/// Shells out to poppler's `pdfinfo` and `pdftoppm`, one process per batch.
pub struct PopplerRasterizer;

#[async_trait]
impl Rasterizer for PopplerRasterizer {
    async fn page_count(&self, pdf: &Path) -> Result<u32> {
        let output = Command::new("pdfinfo")
            .arg(pdf)
            .output()
            .await
            .context("Failed to spawn pdfinfo (is poppler installed?)")?;
        if !output.status.success() {
            bail!(
                "pdfinfo failed for {}: {}",
                pdf.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        parse_pdfinfo_pages(&String::from_utf8_lossy(&output.stdout))
            .ok_or_else(|| anyhow!("pdfinfo reported no page count for {}", pdf.display()))
    }

    async fn render_batch(
        &self,
        pdf: &Path,
        out_dir: &Path,
        first: u32,
        last: u32,
        dpi: u32,
    ) -> Result<Vec<PathBuf>> {
        // pdftoppm pads numbers by document length, so render into a scratch
        // directory and rename into place.
        let scratch = out_dir.join(format!(".batch_{:04}_{:04}", first, last));
        tokio::fs::create_dir_all(&scratch).await?;

        let output = Command::new("pdftoppm")
            .arg("-png")
            .arg("-r")
            .arg(dpi.to_string())
            .arg("-f")
            .arg(first.to_string())
            .arg("-l")
            .arg(last.to_string())
            .arg(pdf)
            .arg(scratch.join("page"))
            .output()
            .await
            .context("Failed to spawn pdftoppm (is poppler installed?)")?;
        if !output.status.success() {
            bail!(
                "pdftoppm failed for pages {}-{}: {}",
                first,
                last,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let mut produced = Vec::new();
        let mut entries = tokio::fs::read_dir(&scratch).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let n = page_index(&path)
                .ok_or_else(|| anyhow!("Unexpected pdftoppm output {}", path.display()))?;
            let target = out_dir.join(format!("page_{:04}.png", n));
            tokio::fs::rename(&path, &target).await?;
            produced.push(target);
        }
        tokio::fs::remove_dir_all(&scratch).await?;
        Ok(produced)
    }
}

fn parse_pdfinfo_pages(stdout: &str) -> Option<u32> {
    stdout
        .lines()
        .find_map(|line| line.strip_prefix("Pages:"))
        .and_then(|v| v.trim().parse().ok())
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedPages {
    /// The clamped range actually rendered.
    pub range: Option<(u32, u32)>,
    /// `(page_number, image_path)` ascending by page number.
    pub pages: Vec<(u32, PathBuf)>,
}

pub struct Renderer {
    rasterizer: Arc<dyn Rasterizer>,
    dpi: u32,
    batch_size: u32,
    max_workers: usize,
}

impl Renderer {
    pub fn new(rasterizer: Arc<dyn Rasterizer>, config: &RenderConfig) -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            rasterizer,
            dpi: config.dpi,
            batch_size: config.batch_size,
            max_workers: cpus.min(config.max_workers).max(1),
        }
    }

    pub async fn render(
        &self,
        pdf: &Path,
        out_dir: &Path,
        requested: Option<(u32, Option<u32>)>,
    ) -> Result<RenderedPages> {
        let total = self.rasterizer.page_count(pdf).await?;
        let Some((first, last)) = resolve_range(requested, total) else {
            info!("Nothing to render: requested {:?} of {} pages", requested, total);
            return Ok(RenderedPages {
                range: None,
                pages: Vec::new(),
            });
        };
        tokio::fs::create_dir_all(out_dir)
            .await
            .with_context(|| format!("Failed to create {}", out_dir.display()))?;

        let batches = plan_batches(first, last, self.batch_size);
        info!(
            "Rendering pages {}-{} of {} in {} batches ({} workers)",
            first,
            last,
            total,
            batches.len(),
            self.max_workers
        );

        let rasterizer = &self.rasterizer;
        let dpi = self.dpi;
        let results: Vec<Result<Vec<PathBuf>>> = futures_util::stream::iter(batches)
            .map(|(b_first, b_last)| async move {
                let paths = rasterizer
                    .render_batch(pdf, out_dir, b_first, b_last, dpi)
                    .await
                    .with_context(|| format!("Render batch {}-{} failed", b_first, b_last))?;
                debug!("Batch {}-{} produced {} pages", b_first, b_last, paths.len());
                Ok(paths)
            })
            .buffer_unordered(self.max_workers)
            .collect()
            .await;

        let mut pages = Vec::with_capacity((last - first + 1) as usize);
        for res in results {
            for path in res? {
                let n = page_index(&path)
                    .ok_or_else(|| anyhow!("Cannot read page number from {}", path.display()))?;
                pages.push((n, path));
            }
        }
        // Batches complete in any order
        pages.sort_by_key(|(n, _)| *n);

        let numbers: Vec<u32> = pages.iter().map(|(n, _)| *n).collect();
        if numbers != (first..=last).collect::<Vec<u32>>() {
            bail!(
                "Rendered pages {:?} do not match requested range {}-{}",
                numbers,
                first,
                last
            );
        }

        Ok(RenderedPages {
            range: Some((first, last)),
            pages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Returns paths without touching disk. Earlier batches finish later.
    struct MockRasterizer {
        total: u32,
        fail_batch: Option<u32>,
        batches: Mutex<Vec<(u32, u32)>>,
    }

    impl MockRasterizer {
        fn new(total: u32) -> Self {
            Self {
                total,
                fail_batch: None,
                batches: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Rasterizer for MockRasterizer {
        async fn page_count(&self, _pdf: &Path) -> Result<u32> {
            Ok(self.total)
        }

        async fn render_batch(
            &self,
            _pdf: &Path,
            out_dir: &Path,
            first: u32,
            last: u32,
            _dpi: u32,
        ) -> Result<Vec<PathBuf>> {
            self.batches.lock().unwrap().push((first, last));
            tokio::time::sleep(Duration::from_millis(((self.total - first) * 5) as u64)).await;
            if self.fail_batch == Some(first) {
                bail!("worker crashed");
            }
            // Reverse order inside the batch as well
            Ok((first..=last)
                .rev()
                .map(|n| out_dir.join(format!("page_{:04}.png", n)))
                .collect())
        }
    }

    fn renderer(mock: Arc<MockRasterizer>, batch_size: u32) -> Renderer {
        let config = RenderConfig {
            dpi: 72,
            batch_size,
            max_workers: 4,
        };
        Renderer::new(mock, &config)
    }

    #[test]
    fn test_plan_batches() {
        assert_eq!(plan_batches(1, 7, 3), vec![(1, 3), (4, 6), (7, 7)]);
        assert_eq!(plan_batches(5, 8, 10), vec![(5, 8)]);
        assert_eq!(plan_batches(3, 2, 3), vec![]);
        assert_eq!(plan_batches(1, 2, 0), vec![(1, 1), (2, 2)]);
    }

    #[test]
    fn test_resolve_range() {
        assert_eq!(resolve_range(None, 20), Some((1, 20)));
        assert_eq!(resolve_range(Some((5, Some(8))), 20), Some((5, 8)));
        assert_eq!(resolve_range(Some((0, Some(50))), 20), Some((1, 20)));
        // Open-ended start resolves to the real page count
        assert_eq!(resolve_range(Some((15, None)), 20), Some((15, 20)));
        assert_eq!(resolve_range(Some((21, None)), 20), None);
        assert_eq!(resolve_range(None, 0), None);
    }

    #[test]
    fn test_page_index() {
        assert_eq!(page_index(Path::new("/x/page_0012.png")), Some(12));
        assert_eq!(page_index(Path::new("page-007.png")), Some(7));
        assert_eq!(page_index(Path::new("cover.png")), None);
    }

    #[test]
    fn test_parse_pdfinfo_pages() {
        let out = "Title:          Tintin\nPages:          62\nEncrypted:      no\n";
        assert_eq!(parse_pdfinfo_pages(out), Some(62));
        assert_eq!(parse_pdfinfo_pages("Title: x\n"), None);
    }

    #[tokio::test]
    async fn test_render_sorts_out_of_order_batches() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let mock = Arc::new(MockRasterizer::new(7));
        let out = renderer(mock.clone(), 3)
            .render(Path::new("in.pdf"), temp_dir.path(), None)
            .await?;

        assert_eq!(out.range, Some((1, 7)));
        let numbers: Vec<u32> = out.pages.iter().map(|(n, _)| *n).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5, 6, 7]);
        assert!(out.pages[0].1.ends_with("page_0001.png"));

        let mut batches = mock.batches.lock().unwrap().clone();
        batches.sort();
        assert_eq!(batches, vec![(1, 3), (4, 6), (7, 7)]);
        Ok(())
    }

    #[tokio::test]
    async fn test_render_sub_range_single_batch() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let mock = Arc::new(MockRasterizer::new(20));
        let out = renderer(mock.clone(), 10)
            .render(Path::new("in.pdf"), temp_dir.path(), Some((5, Some(8))))
            .await?;
        assert_eq!(out.pages.len(), 4);
        assert_eq!(out.pages[0].0, 5);
        assert_eq!(*mock.batches.lock().unwrap(), vec![(5, 8)]);
        Ok(())
    }

    #[tokio::test]
    async fn test_start_past_end_is_empty() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let mock = Arc::new(MockRasterizer::new(5));
        let out = renderer(mock.clone(), 3)
            .render(Path::new("in.pdf"), temp_dir.path(), Some((9, None)))
            .await?;
        assert!(out.pages.is_empty());
        assert_eq!(out.range, None);
        assert!(mock.batches.lock().unwrap().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_one_failed_batch_fails_render() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut mock = MockRasterizer::new(9);
        mock.fail_batch = Some(4);
        let result = renderer(Arc::new(mock), 3)
            .render(Path::new("in.pdf"), temp_dir.path(), None)
            .await;
        let err = result.unwrap_err();
        assert!(format!("{:#}", err).contains("worker crashed"));
    }
}
