//! 逗号分隔表格读写
//!
//! 输入表来自模拟器与采集软件的导出（常带pandas的无名索引列），
//! 输出为扁平CSV。只处理数值与简单标签字段，不支持带引号的逗号。

use crate::core::accumulator::{EventLog, SignalDefinition};
use crate::core::aggregate::{ConditionKey, Population, ReplicateRecord};
use crate::core::histogram::{BackgroundEntry, BackgroundTable, RawFrame};
use crate::core::sampler::{ChannelCounts, EmissionEvent};
use crate::error::{format_error, AnalysisError, AnalysisResult};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// 已解析的表格（表头 + 字符串单元格）
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    source: String,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    /// 解析表格文本
    ///
    /// 表头首列为空时视为pandas索引列并丢弃。空行被忽略。
    pub fn parse(text: &str, source: &str) -> AnalysisResult<Self> {
        let mut lines = text.lines().filter(|l| !l.trim().is_empty());
        let header_line = lines
            .next()
            .ok_or_else(|| AnalysisError::FormatError(format!("{source}: 空表格")))?;

        let mut headers: Vec<String> = split_fields(header_line);
        let drop_index = headers.first().is_some_and(|h| h.is_empty());
        if drop_index {
            headers.remove(0);
        }

        let mut rows = Vec::new();
        for (line_no, line) in lines.enumerate() {
            let mut fields = split_fields(line);
            if drop_index && !fields.is_empty() {
                fields.remove(0);
            }
            if fields.len() != headers.len() {
                return Err(AnalysisError::FormatError(format!(
                    "{source}: 第 {} 行有 {} 个字段，表头有 {} 列",
                    line_no + 2,
                    fields.len(),
                    headers.len()
                )));
            }
            rows.push(fields);
        }

        Ok(Self {
            source: source.to_string(),
            headers,
            rows,
        })
    }

    /// 读取文件并解析
    pub fn read(path: &Path) -> AnalysisResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text, &path.display().to_string())
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// 按候选名查找列（第一个命中的名字生效）
    pub fn optional_column(&self, names: &[&str]) -> Option<usize> {
        names
            .iter()
            .find_map(|name| self.headers.iter().position(|h| h == name))
    }

    /// 必需列
    pub fn column(&self, names: &[&str]) -> AnalysisResult<usize> {
        self.optional_column(names).ok_or_else(|| {
            AnalysisError::FormatError(format!(
                "{}: 缺少列 {}",
                self.source,
                names.join(" / ")
            ))
        })
    }

    /// 原始单元格
    pub fn cell(&self, row: usize, col: usize) -> &str {
        &self.rows[row][col]
    }

    /// 解析数值单元格
    pub fn parse_at<T: std::str::FromStr>(&self, row: usize, col: usize) -> AnalysisResult<T>
    where
        T::Err: std::fmt::Display,
    {
        let raw = self.cell(row, col);
        raw.parse::<T>().map_err(|e| {
            format_error(
                &format!(
                    "{}: 第 {} 行列 '{}' 的值 '{raw}'",
                    self.source,
                    row + 2,
                    self.headers[col]
                ),
                e,
            )
        })
    }

    /// 计数单元格：接受 `12` 与 `12.0` 两种写法
    pub fn count_at(&self, row: usize, col: usize) -> AnalysisResult<u64> {
        let value: f64 = self.parse_at(row, col)?;
        if value < 0.0 || value.fract() != 0.0 || !value.is_finite() {
            return Err(AnalysisError::FormatError(format!(
                "{}: 第 {} 行计数 '{}' 不是非负整数",
                self.source,
                row + 2,
                self.cell(row, col)
            )));
        }
        Ok(value as u64)
    }
}

fn split_fields(line: &str) -> Vec<String> {
    line.split(',').map(|f| f.trim().to_string()).collect()
}

// ==================== 输入表 ====================

/// 发射事件表：`x, y, z, t` 以及可选的 `initial_state, final_state`
///
/// 无状态列时所有事件归入单重态发射信号。
pub fn read_events(path: &Path) -> AnalysisResult<EventLog> {
    events_from_table(&Table::read(path)?)
}

pub fn events_from_table(table: &Table) -> AnalysisResult<EventLog> {
    let cx = table.column(&["x"])?;
    let cy = table.column(&["y"])?;
    let cz = table.column(&["z"])?;
    let ct = table.column(&["t", "time", "transition_time"])?;
    let states = table
        .optional_column(&["initial_state"])
        .zip(table.optional_column(&["final_state"]));

    let default_signal = SignalDefinition::singlet_emission();
    let mut log = EventLog::new();
    for row in 0..table.len() {
        let event = EmissionEvent::new(
            table.parse_at(row, cx)?,
            table.parse_at(row, cy)?,
            table.parse_at(row, cz)?,
            table.parse_at(row, ct)?,
        );
        match states {
            Some((ci, cf)) => log.push(
                &SignalDefinition::new(table.cell(row, ci), table.cell(row, cf)),
                event,
            ),
            None => log.push(&default_signal, event),
        }
    }
    Ok(log)
}

/// 触发帧TCSPC导出
///
/// 每个 `trigger_frame` 一组，每组恰好 `total_bins` 行；帧 `f` 的计数位于
/// `detectorA{f-1}` / `detectorB{f-1}` 列。
pub fn read_trigger_frames(path: &Path, total_bins: usize) -> AnalysisResult<Vec<RawFrame>> {
    trigger_frames_from_table(&Table::read(path)?, total_bins)
}

pub fn trigger_frames_from_table(table: &Table, total_bins: usize) -> AnalysisResult<Vec<RawFrame>> {
    let c_frame = table.column(&["trigger_frame"])?;
    let c_bin = table.column(&["time_bin"])?;

    let mut groups: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
    for row in 0..table.len() {
        groups
            .entry(table.parse_at(row, c_frame)?)
            .or_default()
            .push(row);
    }

    let mut frames = Vec::with_capacity(groups.len());
    for (frame, mut rows) in groups {
        if rows.len() != total_bins {
            return Err(AnalysisError::ShapeMismatch(format!(
                "触发帧 {frame} 有 {} 行，应为 {total_bins} 行（每帧一次记录）",
                rows.len()
            )));
        }
        if frame == 0 {
            return Err(AnalysisError::FormatError(
                "触发帧号从1开始".to_string(),
            ));
        }
        let name_a = format!("detectorA{}", frame - 1);
        let name_b = format!("detectorB{}", frame - 1);
        let c_a = table.column(&[name_a.as_str()])?;
        let c_b = table.column(&[name_b.as_str()])?;

        let mut keyed = Vec::with_capacity(rows.len());
        for row in rows.drain(..) {
            keyed.push((table.parse_at::<u32>(row, c_bin)?, row));
        }
        keyed.sort_by_key(|(bin, _)| *bin);

        let mut channel_a = Vec::with_capacity(total_bins);
        let mut channel_b = Vec::with_capacity(total_bins);
        for (_, row) in keyed {
            channel_a.push(table.parse_at(row, c_a)?);
            channel_b.push(table.parse_at(row, c_b)?);
        }
        frames.push(RawFrame {
            frame,
            channel_a,
            channel_b,
        });
    }
    Ok(frames)
}

/// 即时信号TCSPC导出：`time_bin, detectorA, detectorB`
pub fn read_prompt(path: &Path) -> AnalysisResult<RawFrame> {
    prompt_from_table(&Table::read(path)?)
}

pub fn prompt_from_table(table: &Table) -> AnalysisResult<RawFrame> {
    let c_bin = table.column(&["time_bin"])?;
    let c_a = table.column(&["detectorA"])?;
    let c_b = table.column(&["detectorB"])?;

    let mut rows = Vec::with_capacity(table.len());
    for row in 0..table.len() {
        rows.push((
            table.parse_at::<u32>(row, c_bin)?,
            table.parse_at::<f64>(row, c_a)?,
            table.parse_at::<f64>(row, c_b)?,
        ));
    }
    rows.sort_by_key(|(bin, _, _)| *bin);

    Ok(RawFrame {
        frame: 0,
        channel_a: rows.iter().map(|r| r.1).collect(),
        channel_b: rows.iter().map(|r| r.2).collect(),
    })
}

/// 背景表：`frame, bkgd_group, bkgd_A, bkgd_B`
pub fn read_background(path: &Path) -> AnalysisResult<BackgroundTable> {
    background_from_table(&Table::read(path)?)
}

pub fn background_from_table(table: &Table) -> AnalysisResult<BackgroundTable> {
    let c_frame = table.column(&["frame"])?;
    let c_group = table.column(&["bkgd_group"])?;
    let c_a = table.column(&["bkgd_A"])?;
    let c_b = table.column(&["bkgd_B"])?;

    let mut entries = Vec::with_capacity(table.len());
    for row in 0..table.len() {
        entries.push(BackgroundEntry {
            frame: table.parse_at(row, c_frame)?,
            bkgd_group: table.parse_at(row, c_group)?,
            bkgd_a: table.parse_at(row, c_a)?,
            bkgd_b: table.parse_at(row, c_b)?,
        });
    }
    Ok(BackgroundTable::new(entries))
}

/// 副本计数表（接受两套列名）
///
/// 群体列可以是单一扩散时间，也可以是混合物标签 `450-3000`。
pub fn read_replicates(path: &Path) -> AnalysisResult<Vec<ReplicateRecord>> {
    replicates_from_table(&Table::read(path)?)
}

pub fn replicates_from_table(table: &Table) -> AnalysisResult<Vec<ReplicateRecord>> {
    let c_pop = table.column(&["diffusion_time_ns", "diff_time_ns"])?;
    let c_delay = table.column(&["delay_time_ns", "delay_ns"])?;
    let c_x = table.column(&["counts_x", "x"])?;
    let c_y = table.column(&["counts_y", "y"])?;
    let c_sat = table.optional_column(&["saturation"]);
    let c_rep = table.optional_column(&["replicate"]);

    let mut records = Vec::with_capacity(table.len());
    for row in 0..table.len() {
        let population: Population = table.cell(row, c_pop).parse()?;
        let saturation = c_sat.map(|c| table.parse_at::<f64>(row, c)).transpose()?;
        let replicate = c_rep.map(|c| table.parse_at::<u32>(row, c)).transpose()?;
        records.push(ReplicateRecord {
            key: ConditionKey {
                population,
                delay_time_ns: table.parse_at(row, c_delay)?,
                saturation,
            },
            replicate: replicate.unwrap_or(0),
            counts: ChannelCounts::new(table.count_at(row, c_x)?, table.count_at(row, c_y)?),
        });
    }
    Ok(records)
}

// ==================== 输出表 ====================

/// 扁平CSV写入器（文件在drop时关闭）
pub struct CsvWriter {
    out: BufWriter<File>,
    columns: usize,
}

impl CsvWriter {
    /// 创建文件并写入表头
    pub fn create(path: &Path, headers: &[&str]) -> AnalysisResult<Self> {
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(out, "{}", headers.join(","))?;
        Ok(Self {
            out,
            columns: headers.len(),
        })
    }

    /// 写入一行（字段数必须与表头一致）
    pub fn row(&mut self, fields: &[String]) -> AnalysisResult<()> {
        if fields.len() != self.columns {
            return Err(AnalysisError::ShapeMismatch(format!(
                "输出行有 {} 个字段，表头有 {} 列",
                fields.len(),
                self.columns
            )));
        }
        writeln!(self.out, "{}", fields.join(","))?;
        Ok(())
    }

    /// 刷新缓冲
    pub fn finish(mut self) -> AnalysisResult<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// 浮点数输出格式（NaN 写为空字段，与pandas一致）
pub fn fmt_f64(value: f64) -> String {
    if value.is_nan() {
        String::new()
    } else {
        value.to_string()
    }
}

/// 可选浮点数
pub fn fmt_opt(value: Option<f64>) -> String {
    value.map(fmt_f64).unwrap_or_default()
}
