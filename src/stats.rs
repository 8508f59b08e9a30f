use std::fmt;

/// 被覆盖像素的汇总统计
///
/// 只有至少一个像素匹配时才存在；"没有统计"表示几何与栅格没有足够的重叠，
/// 与"平均值为0"是不同的含义。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stats {
    pub count: usize,
    pub sum: f64,
    pub mean: f64,
}

/// 显示为保留两位小数的平均值，可直接用作要素标注
impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.mean)
    }
}

/// 统计累加器
///
/// 每个匹配值放进以像素序号为下标的槽位，最后按行优先顺序求和，
/// 这样无论结果以什么顺序到达，总和都逐位相同。
#[derive(Debug, Clone)]
pub struct StatsAccumulator {
    slots: Vec<Option<f64>>,
    count: usize,
}

impl StatsAccumulator {
    /// 为 `cell_count` 个像素创建累加器
    pub fn new(cell_count: usize) -> Self {
        StatsAccumulator {
            slots: vec![None; cell_count],
            count: 0,
        }
    }

    /// 记录序号为 `index` 的像素的值
    ///
    /// 同一个像素重复记录时只保留最后一次；超出范围的序号会扩展槽位。
    pub fn add(&mut self, index: usize, value: f64) {
        if index >= self.slots.len() {
            self.slots.resize(index + 1, None);
        }
        if self.slots[index].replace(value).is_none() {
            self.count += 1;
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// 计算统计结果，没有任何值时返回`None`
    pub fn finish(self) -> Option<Stats> {
        if self.count == 0 {
            return None;
        }
        let sum: f64 = self.slots.into_iter().flatten().sum();
        Some(Stats {
            count: self.count,
            sum,
            mean: sum / self.count as f64,
        })
    }
}
